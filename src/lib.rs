use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

pub mod blob;
pub mod config;
pub mod db;
pub mod error;
pub mod http;
pub mod ingest;
pub mod memory;
pub mod queue;
pub mod reconcile;
pub mod store;
pub mod telemetry;
pub mod thumbnail;
pub mod worker;

pub use error::{AppError, Result};

/// Processing status of an uploaded image.
///
/// Transitions go through [`Status::transition`]; anything not listed there is
/// rejected. `Done` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "image_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    New,
    Processing,
    Done,
    Error,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::New => "NEW",
            Status::Processing => "PROCESSING",
            Status::Done => "DONE",
            Status::Error => "ERROR",
        }
    }

    pub fn can_transition_to(self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (New, Processing)
                | (Processing, Processing)
                | (Processing, Done)
                | (Processing, Error)
                | (Error, Processing)
                | (Error, Error)
        )
    }

    pub fn transition(self, next: Status) -> Result<Status> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(AppError::Transition {
                from: self,
                to: next,
            })
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Target thumbnail dimensions, written as `{width}x{height}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThumbnailSize {
    pub width: u32,
    pub height: u32,
}

impl ThumbnailSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

impl fmt::Display for ThumbnailSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

impl FromStr for ThumbnailSize {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (w, h) = s
            .trim()
            .split_once(['x', 'X'])
            .ok_or_else(|| format!("expected WIDTHxHEIGHT, got {s:?}"))?;
        let width: u32 = w.parse().map_err(|_| format!("invalid width in {s:?}"))?;
        let height: u32 = h.parse().map_err(|_| format!("invalid height in {s:?}"))?;
        if width == 0 || height == 0 {
            return Err(format!("thumbnail dimensions must be positive, got {s:?}"));
        }
        Ok(Self { width, height })
    }
}

/// Thumbnail paths keyed by size label.
///
/// Either empty or holding exactly one entry per configured size.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Thumbnails(BTreeMap<String, String>);

impl Thumbnails {
    /// Builds a full set, checking the labels match `sizes` exactly.
    pub fn complete(sizes: &[ThumbnailSize], entries: BTreeMap<String, String>) -> Result<Self> {
        if sizes.is_empty() {
            return Err(AppError::InvalidThumbnails(
                "no thumbnail sizes configured".into(),
            ));
        }
        for size in sizes {
            if !entries.contains_key(&size.label()) {
                return Err(AppError::InvalidThumbnails(format!(
                    "missing size {size}"
                )));
            }
        }
        if let Some(extra) = entries
            .keys()
            .find(|label| !sizes.iter().any(|s| &s.label() == *label))
        {
            return Err(AppError::InvalidThumbnails(format!(
                "unexpected size {extra}"
            )));
        }
        Ok(Self(entries))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.0.get(label).map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub(crate) fn from_stored(entries: BTreeMap<String, String>) -> Self {
        Self(entries)
    }

    pub(crate) fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: Uuid,
    pub status: Status,
    pub original_filename: String,
    pub original_path: String,
    pub original_size: i64,
    pub thumbnails: Thumbnails,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ImageRecord {
    pub fn new(id: Uuid, original_filename: &str, original_path: &str, original_size: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: Status::New,
            original_filename: original_filename.to_string(),
            original_path: original_path.to_string(),
            original_size: i64::try_from(original_size).unwrap_or(i64::MAX),
            thumbnails: Thumbnails::default(),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_processing(&mut self) -> Result<()> {
        self.set_status(Status::Processing)
    }

    /// Producer side: only a record still at `NEW` moves forward. A worker may
    /// already have picked the task up and finished it.
    pub fn mark_enqueued(&mut self) -> Result<()> {
        if self.status == Status::New {
            self.mark_processing()
        } else {
            Ok(())
        }
    }

    /// Consumer side: re-entering `PROCESSING` is fine for anything but `DONE`.
    pub fn begin_attempt(&mut self) -> Result<()> {
        if self.status == Status::Done {
            Ok(())
        } else {
            self.mark_processing()
        }
    }

    pub fn complete(&mut self, thumbnails: Thumbnails) -> Result<()> {
        if thumbnails.is_empty() {
            return Err(AppError::InvalidThumbnails("empty thumbnail set".into()));
        }
        self.set_status(Status::Done)?;
        self.thumbnails = thumbnails;
        Ok(())
    }

    pub fn fail(&mut self, message: &str) -> Result<()> {
        self.set_status(Status::Error)?;
        let message = message.trim();
        self.error_message = Some(if message.is_empty() {
            "unknown processing error".to_string()
        } else {
            message.to_string()
        });
        Ok(())
    }

    fn set_status(&mut self, next: Status) -> Result<()> {
        self.status = self.status.transition(next)?;
        self.updated_at = Utc::now();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes() -> Vec<ThumbnailSize> {
        vec![ThumbnailSize::new(100, 100), ThumbnailSize::new(300, 300)]
    }

    fn full_set() -> BTreeMap<String, String> {
        BTreeMap::from([
            ("100x100".to_string(), "/t/a_100x100.jpg".to_string()),
            ("300x300".to_string(), "/t/a_300x300.jpg".to_string()),
        ])
    }

    #[test]
    fn status_transitions() {
        assert!(Status::New.can_transition_to(Status::Processing));
        assert!(Status::Processing.can_transition_to(Status::Done));
        assert!(Status::Processing.can_transition_to(Status::Error));
        assert!(Status::Error.can_transition_to(Status::Processing));

        assert!(!Status::New.can_transition_to(Status::Done));
        assert!(!Status::New.can_transition_to(Status::Error));
        assert!(!Status::Done.can_transition_to(Status::Processing));
        assert!(!Status::Done.can_transition_to(Status::Error));
        assert!(!Status::Processing.can_transition_to(Status::New));

        let err = Status::Done.transition(Status::Processing).unwrap_err();
        assert!(matches!(
            err,
            AppError::Transition {
                from: Status::Done,
                to: Status::Processing
            }
        ));
    }

    #[test]
    fn status_serializes_screaming_case() {
        assert_eq!(
            serde_json::to_string(&Status::Processing).unwrap(),
            "\"PROCESSING\""
        );
        assert_eq!(Status::Done.to_string(), "DONE");
    }

    #[test]
    fn parse_thumbnail_size() {
        let size: ThumbnailSize = "300x200".parse().unwrap();
        assert_eq!(size, ThumbnailSize::new(300, 200));
        assert_eq!(size.label(), "300x200");
        assert!("300".parse::<ThumbnailSize>().is_err());
        assert!("0x10".parse::<ThumbnailSize>().is_err());
        assert!("axb".parse::<ThumbnailSize>().is_err());
    }

    #[test]
    fn thumbnails_must_match_configured_sizes() {
        assert!(Thumbnails::complete(&sizes(), full_set()).is_ok());

        let mut partial = full_set();
        partial.remove("300x300");
        assert!(Thumbnails::complete(&sizes(), partial).is_err());

        let mut extra = full_set();
        extra.insert("50x50".into(), "/t/a_50x50.jpg".into());
        assert!(Thumbnails::complete(&sizes(), extra).is_err());
    }

    #[test]
    fn record_lifecycle() {
        let mut record = ImageRecord::new(Uuid::new_v4(), "cat.jpg", "/o/cat.jpg", 10);
        assert_eq!(record.status, Status::New);
        assert!(record.complete(Thumbnails::complete(&sizes(), full_set()).unwrap()).is_err());

        record.mark_enqueued().unwrap();
        assert_eq!(record.status, Status::Processing);
        record
            .complete(Thumbnails::complete(&sizes(), full_set()).unwrap())
            .unwrap();
        assert_eq!(record.status, Status::Done);
        assert_eq!(record.thumbnails.len(), 2);

        // Late producer update and duplicate delivery both leave DONE alone.
        record.mark_enqueued().unwrap();
        record.begin_attempt().unwrap();
        assert_eq!(record.status, Status::Done);
        assert!(record.fail("boom").is_err());
    }

    #[test]
    fn failure_keeps_message_across_retry() {
        let mut record = ImageRecord::new(Uuid::new_v4(), "cat.png", "/o/cat.png", 10);
        record.begin_attempt().unwrap();
        record.fail("  ").unwrap();
        assert_eq!(record.status, Status::Error);
        assert!(!record.error_message.as_deref().unwrap().is_empty());

        record.fail("Processing failed: bad header").unwrap();
        record.begin_attempt().unwrap();
        assert_eq!(record.status, Status::Processing);
        assert_eq!(
            record.error_message.as_deref(),
            Some("Processing failed: bad header")
        );
    }
}
