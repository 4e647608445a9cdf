//! Access reports delivered by the telemetry pipeline.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::identity::ObjectId;

/// One object touched during a unit of work, with its repeat count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessedObject {
    object: ObjectId,
    count: u32,
}

impl AccessedObject {
    /// The object that was accessed.
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// How many times it was accessed in the report.
    pub fn count(&self) -> u32 {
        self.count
    }
}

/// Objects accessed by one completed unit of work.
///
/// Entries are deduplicated and keep first-access order; accessing an object
/// again bumps the existing entry's count.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessDetail {
    objects: Vec<AccessedObject>,
}

impl AccessDetail {
    /// Create an empty detail.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a single access.
    pub fn access(&mut self, object: ObjectId) {
        self.bump(object, 1);
    }

    /// Record `count` accesses at once. A zero count is rejected.
    pub fn access_times(&mut self, object: ObjectId, count: u32) -> Result<()> {
        if count == 0 {
            return Err(Error::InvalidInput(format!(
                "access count for {object} must be positive"
            )));
        }
        self.bump(object, count);
        Ok(())
    }

    /// Builder-style single access.
    #[must_use]
    pub fn with_access(mut self, object: ObjectId) -> Self {
        self.access(object);
        self
    }

    fn bump(&mut self, object: ObjectId, count: u32) {
        match self.objects.iter_mut().find(|o| o.object == object) {
            Some(existing) => existing.count = existing.count.saturating_add(count),
            None => self.objects.push(AccessedObject { object, count }),
        }
    }

    /// Accessed objects in first-access order.
    pub fn objects(&self) -> &[AccessedObject] {
        &self.objects
    }

    /// Number of distinct objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether nothing was accessed.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Sum of all repeat counts.
    pub fn total_accesses(&self) -> u64 {
        self.objects.iter().map(|o| u64::from(o.count)).sum()
    }
}

impl FromIterator<ObjectId> for AccessDetail {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        let mut detail = Self::new();
        for object in iter {
            detail.access(object);
        }
        detail
    }
}
