//! Identity entity model: Person → Face → Image → Similarity.
//!
//! Every level is a container entry. A face keeps its images ordered by
//! confidence, so the last image is the best reference and the least
//! confident one is evicted first. JSON layout of a stored person:
//!
//! ```text
//! { "_type": "person", "entry_id": "...", "updated_at": 1700000000000, "_name": null,
//!   "face": { "images": [
//!     { "entry_id": "...", "updated_at": ..., "file_name": "...",
//!       "_similarities": [ { "entry_id": "...", "updated_at": ..., "_value": 0.93 } ] } ] } }
//! ```

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashSet;
use vigil_store::container::{ContainerError, DEFAULT_MAX_SIZE};
use vigil_store::{Entry, EntryMeta, MapContainer};

/// Discriminator written into every person record.
pub const PERSON_TYPE: &str = "person";
/// Images kept per face.
pub const IMAGES_PER_FACE: usize = DEFAULT_MAX_SIZE;
/// Similarity scores kept per image.
pub const SIMILARITIES_PER_IMAGE: usize = DEFAULT_MAX_SIZE;

/// One confidence score from one recognition event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Similarity {
    #[serde(flatten)]
    meta: EntryMeta,
    #[serde(rename = "_value")]
    value: f32,
}

impl Similarity {
    /// Create a score, clamped to `[0, 1]`.
    pub fn new(value: f32) -> Self {
        let value = if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) };
        Self {
            meta: EntryMeta::default(),
            value,
        }
    }

    pub fn value(&self) -> f32 {
        self.value
    }
}

impl Entry for Similarity {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntryMeta {
        &mut self.meta
    }
}

fn by_value(a: &Similarity, b: &Similarity) -> Ordering {
    a.value.total_cmp(&b.value)
}

/// One stored crop of a face.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "ImageRepr", from = "ImageRepr")]
pub struct Image {
    meta: EntryMeta,
    file_name: String,
    similarities: MapContainer<Similarity>,
}

#[derive(Serialize, Deserialize)]
struct ImageRepr {
    #[serde(flatten)]
    meta: EntryMeta,
    file_name: String,
    #[serde(rename = "_similarities", default)]
    similarities: Vec<Similarity>,
}

impl Image {
    /// `file_name` is the blob name of the crop in the content cache.
    pub fn new(file_name: impl Into<String>) -> Self {
        Self {
            meta: EntryMeta::default(),
            file_name: file_name.into(),
            similarities: similarity_container(),
        }
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Mean of the recorded similarity values; 0 when there are none.
    pub fn similarity(&self) -> f32 {
        let values = self.similarities.get_all();
        if values.is_empty() {
            return 0.0;
        }
        values.iter().map(|s| s.value()).sum::<f32>() / values.len() as f32
    }

    pub fn add_similarity(&mut self, similarity: Similarity) -> Result<String, ContainerError> {
        self.similarities.add(similarity, None)
    }

    /// Scores in ascending order of value.
    pub fn similarities(&self) -> Vec<&Similarity> {
        self.similarities.get_all_sorted()
    }
}

impl Entry for Image {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntryMeta {
        &mut self.meta
    }
}

impl From<Image> for ImageRepr {
    fn from(image: Image) -> Self {
        let similarities = image.similarities().into_iter().cloned().collect();
        Self {
            meta: image.meta,
            file_name: image.file_name,
            similarities,
        }
    }
}

impl From<ImageRepr> for Image {
    fn from(repr: ImageRepr) -> Self {
        let mut similarities = similarity_container();
        for similarity in repr.similarities {
            similarities.restore(similarity);
        }
        similarities.check_max_size();

        Self {
            meta: repr.meta,
            file_name: repr.file_name,
            similarities,
        }
    }
}

fn similarity_container() -> MapContainer<Similarity> {
    MapContainer::new(Some(SIMILARITIES_PER_IMAGE)).with_order(by_value)
}

/// Most confident first to evict last; recency breaks ties.
fn by_confidence(a: &Image, b: &Image) -> Ordering {
    a.similarity()
        .total_cmp(&b.similarity())
        .then_with(|| a.updated_at().cmp(&b.updated_at()))
}

/// The face of a person: a bounded, confidence-ordered set of images.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "FaceRepr", from = "FaceRepr")]
pub struct Face {
    images: MapContainer<Image>,
}

#[derive(Serialize, Deserialize)]
struct FaceRepr {
    #[serde(default)]
    images: Vec<Image>,
}

impl Face {
    pub fn new() -> Self {
        Self {
            images: image_container(),
        }
    }

    /// Add an image. The least confident image is evicted past capacity.
    pub fn add_image(&mut self, image: Image) -> Result<String, ContainerError> {
        self.images.add(image, None)
    }

    /// Record a new score against a stored image.
    pub fn add_similarity(&mut self, image_id: &str, similarity: Similarity) -> Result<String, ContainerError> {
        self.images
            .update_with(image_id, None, |image| image.add_similarity(similarity))?
    }

    /// The best reference image: highest mean similarity, most recent on ties.
    pub fn image(&self) -> Option<&Image> {
        self.images.last()
    }

    /// All images, least confident first.
    pub fn images(&self) -> Vec<&Image> {
        self.images.get_all_sorted()
    }

    pub fn get_image(&self, image_id: &str) -> Result<&Image, ContainerError> {
        self.images.get(image_id)
    }

    pub fn file_names(&self) -> HashSet<String> {
        self.images.get_all().into_iter().map(|i| i.file_name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

impl Default for Face {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Face> for FaceRepr {
    fn from(face: Face) -> Self {
        Self {
            images: face.images().into_iter().cloned().collect(),
        }
    }
}

impl From<FaceRepr> for Face {
    fn from(repr: FaceRepr) -> Self {
        let mut images = image_container();
        for image in repr.images {
            images.restore(image);
        }
        images.check_max_size();
        Self { images }
    }
}

fn image_container() -> MapContainer<Image> {
    MapContainer::new(Some(IMAGES_PER_FACE)).with_order(by_confidence)
}

/// A known (or newly seen) identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "PersonRepr", try_from = "PersonRepr")]
pub struct Person {
    meta: EntryMeta,
    name: Option<String>,
    face: Face,
}

#[derive(Serialize, Deserialize)]
struct PersonRepr {
    #[serde(rename = "_type")]
    kind: String,
    #[serde(flatten)]
    meta: EntryMeta,
    #[serde(rename = "_name", default)]
    name: Option<String>,
    #[serde(default)]
    face: Face,
}

impl Person {
    pub fn new() -> Self {
        Self {
            meta: EntryMeta::default(),
            name: None,
            face: Face::new(),
        }
    }

    pub fn with_name(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::new()
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn set_name(&mut self, name: Option<String>) {
        self.name = name;
    }

    pub fn face(&self) -> &Face {
        &self.face
    }

    pub fn face_mut(&mut self) -> &mut Face {
        &mut self.face
    }

    /// Name if set, otherwise the id.
    pub fn label(&self) -> &str {
        self.name().or(self.entry_id()).unwrap_or("<unsaved>")
    }
}

impl Default for Person {
    fn default() -> Self {
        Self::new()
    }
}

impl Entry for Person {
    fn meta(&self) -> &EntryMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntryMeta {
        &mut self.meta
    }

    fn destroy(&mut self) {
        tracing::debug!(person = self.label(), images = self.face.len(), "person destroyed");
    }
}

impl From<Person> for PersonRepr {
    fn from(person: Person) -> Self {
        Self {
            kind: PERSON_TYPE.to_string(),
            meta: person.meta,
            name: person.name,
            face: person.face,
        }
    }
}

impl TryFrom<PersonRepr> for Person {
    type Error = String;

    fn try_from(repr: PersonRepr) -> Result<Self, Self::Error> {
        if repr.kind != PERSON_TYPE {
            return Err(format!("expected _type {PERSON_TYPE:?}, found {:?}", repr.kind));
        }
        Ok(Self {
            meta: repr.meta,
            name: repr.name,
            face: repr.face,
        })
    }
}
