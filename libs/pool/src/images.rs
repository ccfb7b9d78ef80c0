//! Image identity: the "has latest model applied" predicate.
//!
//! Whether two image references describe the same model is provider lore
//! with several reference shapes, so the comparison is pluggable: the
//! engine takes any `ImagesEqual` and defaults to [`default_images_equal`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::ImageSpec;

/// Pluggable image-equality predicate.
pub type ImagesEqual = Arc<dyn Fn(&ImageSpec, &ImageSpec) -> bool + Send + Sync>;

/// Best-effort image comparison.
///
/// Same-shape references compare field-wise (resource IDs
/// case-insensitively, the way the provider treats them); mixed shapes fall
/// back to fingerprint equality, which only matches when the canonical
/// forms agree.
pub fn default_images_equal(a: &ImageSpec, b: &ImageSpec) -> bool {
    match (a, b) {
        (ImageSpec::Id { id: a }, ImageSpec::Id { id: b }) => a.eq_ignore_ascii_case(b),
        (
            ImageSpec::Gallery {
                gallery: ga,
                name: na,
                version: va,
            },
            ImageSpec::Gallery {
                gallery: gb,
                name: nb,
                version: vb,
            },
        ) => ga.eq_ignore_ascii_case(gb) && na == nb && va == vb,
        (
            ImageSpec::Marketplace {
                publisher: pa,
                offer: oa,
                sku: sa,
                version: va,
            },
            ImageSpec::Marketplace {
                publisher: pb,
                offer: ob,
                sku: sb,
                version: vb,
            },
        ) => pa == pb && oa == ob && sa == sb && va == vb,
        _ => a.fingerprint() == b.fingerprint(),
    }
}

/// The default predicate, boxed for injection into the engine.
pub fn default_predicate() -> ImagesEqual {
    Arc::new(default_images_equal)
}

/// Read-through cache of image fingerprints.
///
/// Scoped to a single reconcile pass; repeated lookups for the same image
/// are side-effect free beyond populating the cache.
#[derive(Default)]
pub struct ImageCache {
    // Keyed by the canonical serialized form of the image.
    fingerprints: HashMap<String, String>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fingerprint for an image, computed at most once per pass.
    pub fn fingerprint(&mut self, image: &ImageSpec) -> String {
        let key = serde_json::to_string(image).unwrap_or_else(|_| format!("{image:?}"));
        self.fingerprints
            .entry(key)
            .or_insert_with(|| image.fingerprint())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}
