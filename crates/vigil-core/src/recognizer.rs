//! Identity matching engine.
//!
//! For every face found in an input image the engine scans the known persons,
//! compares the face embedding against each person's reference embedding (the
//! embedding of their best stored crop), and either extends the closest match
//! or creates a new person. Face crops go to the blob store; person records go
//! to the snapshot store. Reference embeddings are cached per person id and
//! recomputed on a miss; a person whose reference cannot be embedded is
//! corrupted and pruned at the end of the call.

use crate::encoder::{EncoderError, FaceEncoder};
use crate::person::{Image, Person, Similarity};
use crate::types::{BoundingBox, Embedding, EuclideanMatcher, Matcher, Reference};
use image::{DynamicImage, ImageFormat, RgbImage};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use vigil_store::{
    ContainerError, Entry, FsStorage, JsonFilePersistence, LockError, LockKey, MapContainer, Record,
    StorageError,
};

/// Blob namespace holding face crops.
pub const FACE_NAMESPACE: &str = "faces";
/// Maximum Euclidean distance still counted as the same person.
pub const DEFAULT_TOLERANCE: f32 = 0.6;
pub const DEFAULT_ENCODING_CACHE_SIZE: usize = 64;

/// Hex digits of the crop hash used in blob names.
const CROP_HASH_LEN: usize = 16;

#[derive(Error, Debug)]
pub enum RecognizerError {
    #[error("image decode failed: {0}")]
    Decode(#[from] image::ImageError),
    #[error("encoder: {0}")]
    Encoder(#[from] EncoderError),
    #[error("encoder task failed: {0}")]
    Task(String),
    #[error("container: {0}")]
    Container(#[from] ContainerError),
    #[error("lock: {0}")]
    Lock(#[from] LockError),
    #[error("storage: {0}")]
    Storage(#[from] StorageError),
    #[error("person {0} has no usable reference image")]
    Corrupted(String),
    #[error("face region lies outside the image")]
    EmptyCrop,
}

/// One resolved face of a recognition call.
#[derive(Debug, Clone)]
pub struct Finding {
    /// The person as stored right after this face was recorded.
    pub person: Person,
    /// True when no known person matched and a new one was created.
    pub unknown: bool,
    /// Score recorded for this face (0 for unknown faces).
    pub similarity: f32,
    pub bbox: BoundingBox,
}

/// Outcome of one recognition call, one finding per face in detection order.
#[derive(Debug, Clone, Default)]
pub struct Recognition {
    pub findings: Vec<Finding>,
}

impl Recognition {
    pub fn unknown_count(&self) -> usize {
        self.findings.iter().filter(|f| f.unknown).count()
    }

    pub fn known_count(&self) -> usize {
        self.findings.len() - self.unknown_count()
    }

    pub fn is_empty(&self) -> bool {
        self.findings.is_empty()
    }
}

/// Face matching engine over a person store and a blob store.
pub struct Recognizer {
    encoder: Arc<dyn FaceEncoder>,
    matcher: Box<dyn Matcher>,
    persons: JsonFilePersistence<Person>,
    storage: FsStorage,
    encodings: Arc<Mutex<EncodingCache>>,
    tolerance: f32,
}

type EncodingCache = MapContainer<Record<Embedding>>;

impl Recognizer {
    /// Build an engine and hook cleanup into the person store: whenever a
    /// person leaves the store, their cached embedding is dropped and their
    /// crops are deleted in the background.
    pub fn new(
        encoder: Arc<dyn FaceEncoder>,
        persons: JsonFilePersistence<Person>,
        storage: FsStorage,
    ) -> Self {
        let encodings = Arc::new(Mutex::new(MapContainer::new(Some(DEFAULT_ENCODING_CACHE_SIZE))));

        let cleanup = storage.clone();
        let cache = encodings.clone();
        persons.set_on_destroy(Arc::new(move |person: &Person| {
            if let Some(person_id) = person.entry_id() {
                forget_encoding(&cache, person_id);
            }
            delete_crops(&cleanup, person.face().file_names());
        }));

        Self {
            encoder,
            matcher: Box::new(EuclideanMatcher),
            persons,
            storage,
            encodings,
            tolerance: DEFAULT_TOLERANCE,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f32) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// Bound the reference-embedding cache (`0` = unbounded).
    pub fn with_encoding_cache_size(mut self, size: usize) -> Self {
        let max_size = (size > 0).then_some(size);
        *self.encodings() = MapContainer::new(max_size);
        self
    }

    pub fn with_matcher(mut self, matcher: Box<dyn Matcher>) -> Self {
        self.matcher = matcher;
        self
    }

    pub fn tolerance(&self) -> f32 {
        self.tolerance
    }

    pub fn persons(&self) -> &JsonFilePersistence<Person> {
        &self.persons
    }

    pub fn storage(&self) -> &FsStorage {
        &self.storage
    }

    /// Number of reference embeddings currently cached.
    pub fn cached_encodings(&self) -> usize {
        self.encodings().len()
    }

    /// Find the faces in an encoded image and resolve each to a person.
    ///
    /// Holds the person store lock for the whole matching pass. A face that
    /// fails to process is logged and skipped; faces before it stay recorded.
    pub async fn recognize(&self, image_bytes: &[u8]) -> Result<Recognition, RecognizerError> {
        let image = Arc::new(image::load_from_memory(image_bytes)?.to_rgb8());

        let faces = {
            let image = image.clone();
            self.run_encoder(move |encoder| encoder.encode(&image)).await?
        };
        tracing::debug!(faces = faces.len(), "faces located");

        let key = self.persons.lock().await;
        let recognition = self.match_faces(&image, faces, key).await;
        match self.persons.unlock(key) {
            Ok(()) => {}
            Err(LockError::WrongKey) => {
                tracing::debug!("person store lock was preempted during recognition");
            }
            Err(e) => tracing::warn!(error = %e, "person store unlock failed"),
        }

        tracing::info!(
            faces = recognition.findings.len(),
            unknown = recognition.unknown_count(),
            known = recognition.known_count(),
            "recognition complete"
        );
        Ok(recognition)
    }

    async fn match_faces(
        &self,
        image: &RgbImage,
        faces: Vec<(BoundingBox, Embedding)>,
        key: LockKey,
    ) -> Recognition {
        let mut corrupted = HashSet::new();
        let mut findings = Vec::with_capacity(faces.len());

        for (index, (bbox, embedding)) in faces.into_iter().enumerate() {
            match self.resolve_face(image, bbox, &embedding, key, &mut corrupted).await {
                Ok(finding) => findings.push(finding),
                Err(e) => tracing::warn!(face = index, error = %e, "face skipped"),
            }
        }

        let pruned = !corrupted.is_empty();
        for person_id in corrupted {
            self.forget_encoding(&person_id);
            match self.persons.remove(&person_id, Some(key)) {
                Ok(_) => tracing::info!(person = %person_id, "pruned corrupted person"),
                Err(ContainerError::NotFound(_)) => {}
                Err(e) => tracing::warn!(person = %person_id, error = %e, "failed to prune corrupted person"),
            }
        }
        if pruned {
            self.persons.flush().await;
        }

        Recognition { findings }
    }

    async fn resolve_face(
        &self,
        image: &RgbImage,
        bbox: BoundingBox,
        embedding: &Embedding,
        key: LockKey,
        corrupted: &mut HashSet<String>,
    ) -> Result<Finding, RecognizerError> {
        // Encode the crop first so a bad box leaves no trace in the store.
        let crop = encode_crop(image, &bbox)?;

        let gallery = self.gallery(corrupted).await;
        let result = self.matcher.compare(embedding, &gallery, self.tolerance);

        let matched = result
            .person_id
            .as_deref()
            .filter(|_| result.matched)
            .and_then(|id| self.persons.get(id).ok());
        let unknown = matched.is_none();

        let mut person = match matched {
            Some(person) => person,
            None => {
                let person_id = self.persons.add(Person::new(), Some(key))?;
                self.persons.get(&person_id)?
            }
        };
        let person_id = person
            .entry_id()
            .map(str::to_string)
            .ok_or_else(|| ContainerError::NotFound("<unassigned>".into()))?;

        // The cached reference embedding belongs to this image.
        let previous_best = best_image_id(&person);
        let previous_files = person.face().file_names();

        if let (false, Some(reference)) = (unknown, previous_best.as_deref()) {
            person
                .face_mut()
                .add_similarity(reference, Similarity::new(result.similarity))?;
        }

        let file_name = format!("{person_id}_{}", content_hash(&crop));
        if let Err(e) = self.storage.begin_put(FACE_NAMESPACE, &file_name, crop, true) {
            tracing::warn!(person = %person_id, file = %file_name, error = %e, "face crop not stored");
        }

        let mut face_image = Image::new(&file_name);
        face_image.add_similarity(Similarity::new(result.similarity))?;
        person.face_mut().add_image(face_image)?;

        let evicted: HashSet<String> = previous_files
            .difference(&person.face().file_names())
            .cloned()
            .collect();
        delete_crops(&self.storage, evicted);

        if best_image_id(&person) != previous_best {
            self.forget_encoding(&person_id);
        }

        self.persons.add_or_update(person.clone(), Some(key))?;
        self.persons.flush().await;

        tracing::debug!(
            person = %person_id,
            unknown,
            similarity = result.similarity,
            distance = result.distance,
            "face resolved"
        );

        Ok(Finding {
            person: self.persons.get(&person_id).unwrap_or(person),
            unknown,
            similarity: result.similarity,
            bbox,
        })
    }

    /// Reference embeddings of every usable known person, least recently
    /// seen first.
    async fn gallery(&self, corrupted: &mut HashSet<String>) -> Vec<Reference> {
        let mut gallery = Vec::new();

        for person in self.persons.get_all_sorted() {
            let Some(person_id) = person.entry_id().map(str::to_string) else {
                continue;
            };
            if corrupted.contains(&person_id) {
                continue;
            }

            match self.reference_embedding(&person_id, &person).await {
                Ok(embedding) => gallery.push(Reference {
                    person_id,
                    embedding,
                }),
                Err(e) => {
                    tracing::warn!(person = %person_id, error = %e, "person marked corrupted");
                    corrupted.insert(person_id);
                }
            }
        }

        gallery
    }

    async fn reference_embedding(
        &self,
        person_id: &str,
        person: &Person,
    ) -> Result<Embedding, RecognizerError> {
        let cached = self.encodings().get(person_id).ok().map(|r| r.value().clone());
        if let Some(embedding) = cached {
            return Ok(embedding);
        }

        let reference = person
            .face()
            .image()
            .ok_or_else(|| RecognizerError::Corrupted(person_id.to_string()))?;
        let bytes = self.storage.get(FACE_NAMESPACE, reference.file_name()).await?;
        let image = image::load_from_memory(&bytes)?.to_rgb8();

        let embedding = self
            .run_encoder(move |encoder| encoder.encode(&image))
            .await?
            .into_iter()
            .next()
            .map(|(_, embedding)| embedding)
            .ok_or_else(|| RecognizerError::Corrupted(person_id.to_string()))?;

        self.encodings()
            .add_or_update(Record::with_id(person_id, embedding.clone()), None)?;
        Ok(embedding)
    }

    fn forget_encoding(&self, person_id: &str) {
        forget_encoding(&self.encodings, person_id);
    }

    async fn run_encoder<T, F>(&self, f: F) -> Result<T, RecognizerError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn FaceEncoder) -> Result<T, EncoderError> + Send + 'static,
    {
        let encoder = self.encoder.clone();
        tokio::task::spawn_blocking(move || f(encoder.as_ref()))
            .await
            .map_err(|e| RecognizerError::Task(e.to_string()))?
            .map_err(RecognizerError::from)
    }

    fn encodings(&self) -> MutexGuard<'_, EncodingCache> {
        self.encodings.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn forget_encoding(encodings: &Mutex<EncodingCache>, person_id: &str) {
    let mut cache = encodings.lock().unwrap_or_else(PoisonError::into_inner);
    let _ = cache.remove(person_id, None);
}

fn best_image_id(person: &Person) -> Option<String> {
    person
        .face()
        .image()
        .and_then(|i| i.entry_id())
        .map(str::to_string)
}

/// JPEG-encode the boxed region of `image`.
fn encode_crop(image: &RgbImage, bbox: &BoundingBox) -> Result<Vec<u8>, RecognizerError> {
    let crop = bbox.crop(image).ok_or(RecognizerError::EmptyCrop)?;
    let mut bytes = Vec::new();
    DynamicImage::ImageRgb8(crop).write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)?;
    Ok(bytes)
}

fn content_hash(bytes: &[u8]) -> String {
    let mut hex = format!("{:x}", Sha256::digest(bytes));
    hex.truncate(CROP_HASH_LEN);
    hex
}

/// Delete crops in the background. Outside a runtime there is nothing to spawn on.
fn delete_crops(storage: &FsStorage, file_names: impl IntoIterator<Item = String>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        tracing::debug!("no async runtime; face crops left in place");
        return;
    };

    for file_name in file_names {
        let storage = storage.clone();
        runtime.spawn(async move {
            match storage.delete(FACE_NAMESPACE, &file_name).await {
                Ok(removed) => tracing::debug!(file = %file_name, removed, "face crop deleted"),
                Err(e) => tracing::warn!(file = %file_name, error = %e, "face crop delete failed"),
            }
        });
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::person::IMAGES_PER_FACE;
    use image::Rgb;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::time::Duration;
    use tempfile::TempDir;
    use tokio::sync::mpsc as async_mpsc;

    /// Treats every square tile (side = image height) as one face and embeds
    /// it as its mean colour.
    pub(crate) struct TileEncoder;

    impl FaceEncoder for TileEncoder {
        fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
            let side = image.height();
            if side == 0 {
                return Ok(Vec::new());
            }
            Ok((0..image.width() / side)
                .map(|i| BoundingBox {
                    x: (i * side) as f32,
                    y: 0.0,
                    width: side as f32,
                    height: side as f32,
                    confidence: 1.0,
                })
                .collect())
        }

        fn embed(&self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError> {
            faces
                .iter()
                .map(|bbox| {
                    let crop = bbox
                        .crop(image)
                        .ok_or_else(|| EncoderError::Failed("empty face".into()))?;
                    let n = (crop.width() * crop.height()) as f32;
                    let mut sum = [0f32; 3];
                    for pixel in crop.pixels() {
                        for (acc, channel) in sum.iter_mut().zip(pixel.0) {
                            *acc += channel as f32;
                        }
                    }
                    Ok(Embedding::new(sum.iter().map(|s| s / n / 255.0).collect()))
                })
                .collect()
        }
    }

    pub(crate) const RED: Rgb<u8> = Rgb([200, 20, 20]);
    pub(crate) const BLUE: Rgb<u8> = Rgb([20, 20, 200]);

    /// PNG of solid-colour tiles, one face per colour.
    pub(crate) fn faces_png(colors: &[Rgb<u8>]) -> Vec<u8> {
        let side = 32;
        let image = RgbImage::from_fn(side * colors.len() as u32, side, |x, _| colors[(x / side) as usize]);
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();
        bytes
    }

    pub(crate) fn recognizer(dir: &TempDir) -> Recognizer {
        let persons = JsonFilePersistence::open(dir.path().join("persons.json"), MapContainer::new(None));
        let storage = FsStorage::new(dir.path().join("blobs"));
        Recognizer::new(Arc::new(TileEncoder), persons, storage)
    }

    pub(crate) async fn settle_storage(storage: &FsStorage) {
        for _ in 0..200 {
            if storage.in_flight() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("blob writes never landed");
    }

    /// Wait for a background delete to remove `path`.
    pub(crate) async fn wait_until_gone(path: &Path) -> bool {
        for _ in 0..200 {
            if !path.exists() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        !path.exists()
    }

    pub(crate) fn crop_path(engine: &Recognizer, person: &Person) -> std::path::PathBuf {
        let crop = person.face().image().unwrap().file_name();
        engine.storage().base().join(FACE_NAMESPACE).join(crop)
    }

    async fn settle() {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }

    /// Tile encoder that blocks inside its `gate_at`-th `embed` call until released.
    struct GatedEncoder {
        calls: AtomicUsize,
        gate_at: usize,
        entered: async_mpsc::UnboundedSender<()>,
        release: Mutex<mpsc::Receiver<()>>,
    }

    impl FaceEncoder for GatedEncoder {
        fn locate(&self, image: &RgbImage) -> Result<Vec<BoundingBox>, EncoderError> {
            TileEncoder.locate(image)
        }

        fn embed(&self, image: &RgbImage, faces: &[BoundingBox]) -> Result<Vec<Embedding>, EncoderError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.gate_at {
                let _ = self.entered.send(());
                let _ = self.release.lock().unwrap().recv();
            }
            TileEncoder.embed(image, faces)
        }
    }

    #[tokio::test]
    async fn test_same_person_twice() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);
        let image = faces_png(&[RED]);

        let first = engine.recognize(&image).await.unwrap();
        assert_eq!(first.findings.len(), 1);
        assert!(first.findings[0].unknown);
        assert_eq!(first.findings[0].similarity, 0.0);

        let second = engine.recognize(&image).await.unwrap();
        assert_eq!(second.findings.len(), 1);
        let finding = &second.findings[0];
        assert!(!finding.unknown);
        assert!(finding.similarity > first.findings[0].similarity);
        assert!(finding.similarity > 0.9, "similarity {}", finding.similarity);

        assert_eq!(engine.persons().len(), 1);
        let person = &engine.persons().get_all()[0];
        assert_eq!(person.face().len(), 2);
        assert_eq!(finding.person.entry_id(), person.entry_id());
        assert!(!engine.persons().is_locked());
    }

    #[tokio::test]
    async fn test_different_people() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        let red = engine.recognize(&faces_png(&[RED])).await.unwrap();
        let blue = engine.recognize(&faces_png(&[BLUE])).await.unwrap();

        assert!(red.findings[0].unknown);
        assert!(blue.findings[0].unknown);
        assert_ne!(red.findings[0].person.entry_id(), blue.findings[0].person.entry_id());
        assert_eq!(engine.persons().len(), 2);
    }

    #[tokio::test]
    async fn test_several_faces_in_one_image() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        let recognition = engine.recognize(&faces_png(&[RED, BLUE])).await.unwrap();
        assert_eq!(recognition.findings.len(), 2);
        assert_eq!(recognition.unknown_count(), 2);
        assert_eq!(engine.persons().len(), 2);

        let again = engine.recognize(&faces_png(&[BLUE, RED])).await.unwrap();
        assert_eq!(again.known_count(), 2);
        assert_eq!(again.findings[0].person.entry_id(), recognition.findings[1].person.entry_id());
        assert_eq!(again.findings[1].person.entry_id(), recognition.findings[0].person.entry_id());
    }

    #[tokio::test]
    async fn test_no_faces() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        // Taller than wide: no complete tile.
        let image = RgbImage::from_pixel(8, 32, RED);
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(image)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let recognition = engine.recognize(&bytes).await.unwrap();
        assert!(recognition.is_empty());
        assert!(engine.persons().is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_input() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);
        let err = engine.recognize(b"not an image").await.unwrap_err();
        assert!(matches!(err, RecognizerError::Decode(_)));
        assert!(!engine.persons().is_locked());
    }

    #[tokio::test]
    async fn test_reference_embedding_cached_per_person() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);
        let image = faces_png(&[RED]);

        engine.recognize(&image).await.unwrap();
        assert_eq!(engine.cached_encodings(), 0);

        engine.recognize(&faces_png(&[BLUE])).await.unwrap();
        assert_eq!(engine.cached_encodings(), 1);

        engine.recognize(&image).await.unwrap();
        assert!(engine.cached_encodings() >= 1);
    }

    #[tokio::test]
    async fn test_corrupted_person_pruned() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        let red = engine.recognize(&faces_png(&[RED])).await.unwrap();
        let red_person = red.findings[0].person.clone();
        let crop = red_person.face().image().unwrap().file_name().to_string();
        engine.storage().delete(FACE_NAMESPACE, &crop).await.unwrap();

        let blue = engine.recognize(&faces_png(&[BLUE])).await.unwrap();
        assert!(blue.findings[0].unknown);

        let remaining = engine.persons().get_all();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].entry_id(), blue.findings[0].person.entry_id());
        assert!(!engine.persons().has(red_person.entry_id().unwrap()));
    }

    #[tokio::test]
    async fn test_persons_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);
        let image = faces_png(&[RED]);
        engine.recognize(&image).await.unwrap();
        engine.recognize(&image).await.unwrap();
        settle_storage(engine.storage()).await;

        let reopened = recognizer(&dir);
        assert_eq!(reopened.persons().len(), 1);
        assert_eq!(reopened.persons().get_all()[0].face().len(), 2);

        let again = reopened.recognize(&image).await.unwrap();
        assert!(!again.findings[0].unknown);
    }

    #[tokio::test]
    async fn test_removed_person_crops_deleted() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        let recognition = engine.recognize(&faces_png(&[RED])).await.unwrap();
        settle_storage(engine.storage()).await;

        let person = &recognition.findings[0].person;
        let crop = person.face().image().unwrap().file_name().to_string();
        let path = engine.storage().base().join(FACE_NAMESPACE).join(&crop);
        assert!(path.exists());

        engine.persons().remove(person.entry_id().unwrap(), None).unwrap();
        assert!(wait_until_gone(&path).await);
    }

    #[tokio::test]
    async fn test_removed_person_encoding_forgotten() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        let red = engine.recognize(&faces_png(&[RED])).await.unwrap();
        engine.recognize(&faces_png(&[BLUE])).await.unwrap();
        assert_eq!(engine.cached_encodings(), 1);

        let red_id = red.findings[0].person.entry_id().unwrap();
        engine.persons().remove(red_id, None).unwrap();
        assert_eq!(engine.cached_encodings(), 0);
    }

    #[tokio::test]
    async fn test_evicted_image_crop_deleted() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        // Slightly different shades of one face: same person, distinct crops.
        let mut seen = HashSet::new();
        for shade in 0..=IMAGES_PER_FACE as u8 {
            let recognition = engine
                .recognize(&faces_png(&[Rgb([200, 20 + shade * 8, 20])]))
                .await
                .unwrap();
            settle_storage(engine.storage()).await;
            seen.extend(recognition.findings[0].person.face().file_names());
        }

        assert_eq!(engine.persons().len(), 1);
        let kept = engine.persons().get_all()[0].face().file_names();
        assert_eq!(kept.len(), IMAGES_PER_FACE);

        let evicted: Vec<_> = seen.difference(&kept).collect();
        assert_eq!(evicted.len(), 1);
        let path = engine.storage().base().join(FACE_NAMESPACE).join(evicted[0]);
        assert!(wait_until_gone(&path).await);

        for name in &kept {
            assert!(engine.storage().contains(FACE_NAMESPACE, name), "{name} missing");
        }
    }

    #[tokio::test]
    async fn test_equal_distance_prefers_least_recently_seen() {
        let dir = TempDir::new().unwrap();
        let engine = recognizer(&dir);

        let crop = encode_crop(&RgbImage::from_pixel(32, 32, RED), &BoundingBox::full(32, 32)).unwrap();
        let mut ids = Vec::new();
        for name in ["older", "newer"] {
            engine
                .storage()
                .put(FACE_NAMESPACE, name, crop.clone(), true)
                .await
                .unwrap();
            let mut image = Image::new(name);
            image.add_similarity(Similarity::new(1.0)).unwrap();
            let mut person = Person::new();
            person.face_mut().add_image(image).unwrap();
            ids.push(engine.persons().add(person, None).unwrap());
        }

        let order: Vec<_> = engine
            .gallery(&mut HashSet::new())
            .await
            .into_iter()
            .map(|r| r.person_id)
            .collect();
        assert_eq!(order, ids);

        let recognition = engine.recognize(&faces_png(&[RED])).await.unwrap();
        let finding = &recognition.findings[0];
        assert!(!finding.unknown);
        assert_eq!(finding.person.entry_id(), Some(ids[0].as_str()));
    }

    #[tokio::test]
    async fn test_preempted_recognition_leaves_store_untouched() {
        let dir = TempDir::new().unwrap();
        let (entered_tx, mut entered) = async_mpsc::unbounded_channel();
        let (release, release_rx) = mpsc::channel();
        let encoder = GatedEncoder {
            calls: AtomicUsize::new(0),
            // Input face of the first call, input face of the second, then
            // the stored reference of the second call.
            gate_at: 3,
            entered: entered_tx,
            release: Mutex::new(release_rx),
        };
        let persons = JsonFilePersistence::open(
            dir.path().join("persons.json"),
            MapContainer::with_max_waiting(None, 1),
        );
        let engine = Arc::new(Recognizer::new(
            Arc::new(encoder),
            persons.clone(),
            FsStorage::new(dir.path().join("blobs")),
        ));

        engine.recognize(&faces_png(&[RED])).await.unwrap();

        let task = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.recognize(&faces_png(&[RED])).await })
        };
        entered.recv().await.unwrap();

        // Fill the queue, then one more: the recognizer's key is revoked.
        let first = {
            let persons = persons.clone();
            tokio::spawn(async move { persons.lock().await })
        };
        settle().await;
        let second = {
            let persons = persons.clone();
            tokio::spawn(async move { persons.lock().await })
        };
        settle().await;

        release.send(()).unwrap();
        let recognition = task.await.unwrap().unwrap();
        assert!(recognition.is_empty());

        let rotated = first.await.unwrap();
        assert!(persons.is_locked());
        assert_eq!(persons.get_all()[0].face().len(), 1);

        persons.unlock(rotated).unwrap();
        let next = second.await.unwrap();
        assert_eq!(next, rotated);
        persons.unlock(next).unwrap();
        assert!(!persons.is_locked());
    }

    #[test]
    fn test_recognition_counts() {
        let finding = |unknown| Finding {
            person: Person::new(),
            unknown,
            similarity: 0.0,
            bbox: BoundingBox::full(1, 1),
        };
        let recognition = Recognition {
            findings: vec![finding(true), finding(false), finding(true)],
        };
        assert_eq!(recognition.unknown_count(), 2);
        assert_eq!(recognition.known_count(), 1);
    }

    #[test]
    fn test_crop_hash_is_stable() {
        assert_eq!(content_hash(b"abc"), content_hash(b"abc"));
        assert_ne!(content_hash(b"abc"), content_hash(b"abd"));
        assert_eq!(content_hash(b"abc").len(), CROP_HASH_LEN);
    }
}
