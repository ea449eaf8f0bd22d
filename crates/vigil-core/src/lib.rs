//! vigil-core — Face identity model and matching engine.
//!
//! Resolves faces in incoming images to known persons (or new ones), keeps
//! their face crops and confidence history, and turns recognition results
//! into notifications through configurable rules. Face location and
//! embedding are delegated to a pluggable [`FaceEncoder`].

pub mod config;
pub mod encoder;
pub mod notifier;
pub mod person;
pub mod pipeline;
pub mod recognizer;
pub mod rule;
pub mod types;

pub use encoder::{EncoderError, FaceEncoder};
pub use person::{Face, Image, Person, Similarity};
pub use recognizer::{Finding, Recognition, Recognizer, RecognizerError};
pub use types::{BoundingBox, Embedding, EuclideanMatcher, Matcher};

use vigil_store::{FsStorage, JsonFilePersistence, MapContainer};

/// Open the person store described by `config`.
pub fn open_persons(config: &config::Config) -> JsonFilePersistence<Person> {
    let container = MapContainer::with_max_waiting(config.max_persons, config.max_waiting);
    JsonFilePersistence::open(&config.persons_file, container)
}

/// Open the face-crop blob store described by `config`.
pub fn open_storage(config: &config::Config) -> FsStorage {
    FsStorage::new(&config.blob_dir)
}

/// Build a matching engine over the stores described by `config`.
pub fn open_recognizer(
    config: &config::Config,
    encoder: std::sync::Arc<dyn FaceEncoder>,
) -> Recognizer {
    Recognizer::new(encoder, open_persons(config), open_storage(config))
        .with_tolerance(config.tolerance)
        .with_encoding_cache_size(config.encoding_cache_size)
}
