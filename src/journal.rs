//! Append-only event log port and its built-in backends.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use crate::error::JournalError;
use crate::event::PersistedEvent;
use crate::storage::StorageLayout;

/// Durable, append-only storage of each entity's events.
///
/// A stream is identified by `(persistence_id, entity_id)`. Sequence numbers
/// within a stream start at 1 and are contiguous.
///
/// # Contract
///
/// - [`append`](Journal::append) must reject an event whose `sequence_nr` is
///   not exactly `highest_sequence_nr + 1` with [`JournalError::Conflict`],
///   leaving the stream untouched.
/// - Once `append` returns `Ok`, the event is visible to every later
///   [`read`](Journal::read) and is never modified or removed.
pub trait Journal: Send + Sync + 'static {
    /// Append one event to the end of a stream.
    fn append(
        &self,
        persistence_id: &str,
        entity_id: &str,
        event: &PersistedEvent,
    ) -> Result<(), JournalError>;

    /// All events of a stream with `sequence_nr > after`, in order.
    fn read(
        &self,
        persistence_id: &str,
        entity_id: &str,
        after: u64,
    ) -> Result<Vec<PersistedEvent>, JournalError>;

    /// Sequence number of the last event in a stream; `0` if it is empty.
    fn highest_sequence_nr(&self, persistence_id: &str, entity_id: &str)
    -> Result<u64, JournalError>;
}

fn check_next(highest: u64, event: &PersistedEvent) -> Result<(), JournalError> {
    let expected = highest + 1;
    if event.sequence_nr != expected {
        return Err(JournalError::Conflict {
            expected,
            actual: event.sequence_nr,
        });
    }
    Ok(())
}

type StreamKey = (String, String);

/// Journal held in process memory. Lost when the process exits.
#[derive(Debug, Default)]
pub struct InMemoryJournal {
    streams: Mutex<HashMap<StreamKey, Vec<PersistedEvent>>>,
}

impl InMemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Journal for InMemoryJournal {
    fn append(
        &self,
        persistence_id: &str,
        entity_id: &str,
        event: &PersistedEvent,
    ) -> Result<(), JournalError> {
        let mut streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let stream = streams
            .entry((persistence_id.to_owned(), entity_id.to_owned()))
            .or_default();
        check_next(stream.len() as u64, event)?;
        stream.push(event.clone());
        Ok(())
    }

    fn read(
        &self,
        persistence_id: &str,
        entity_id: &str,
        after: u64,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (persistence_id.to_owned(), entity_id.to_owned());
        Ok(streams
            .get(&key)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|e| e.sequence_nr > after)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn highest_sequence_nr(
        &self,
        persistence_id: &str,
        entity_id: &str,
    ) -> Result<u64, JournalError> {
        let streams = self.streams.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (persistence_id.to_owned(), entity_id.to_owned());
        Ok(streams.get(&key).map_or(0, |s| s.len() as u64))
    }
}

/// Journal stored as one JSON-lines file per stream.
///
/// Every append is flushed with `sync_data` before returning. The highest
/// sequence number of each stream is cached after the first scan.
#[derive(Debug)]
pub struct FileJournal {
    layout: StorageLayout,
    highest: Mutex<HashMap<PathBuf, u64>>,
}

impl FileJournal {
    /// Open a journal rooted at `base_dir` (see [`StorageLayout`]).
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self::with_layout(StorageLayout::new(base_dir))
    }

    pub fn with_layout(layout: StorageLayout) -> Self {
        Self {
            layout,
            highest: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &StorageLayout {
        &self.layout
    }

    fn read_path(path: &Path, after: u64) -> Result<Vec<PersistedEvent>, JournalError> {
        let file = match fs::File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event: PersistedEvent = serde_json::from_str(&line)?;
            if event.sequence_nr > after {
                events.push(event);
            }
        }
        Ok(events)
    }
}

impl Journal for FileJournal {
    fn append(
        &self,
        persistence_id: &str,
        entity_id: &str,
        event: &PersistedEvent,
    ) -> Result<(), JournalError> {
        let path = self.layout.events_path(persistence_id, entity_id);

        // Held across the write so two appends to one stream cannot interleave.
        let mut highest = self.highest.lock().unwrap_or_else(PoisonError::into_inner);
        let current = match highest.get(&path) {
            Some(n) => *n,
            None => Self::read_path(&path, 0)?
                .last()
                .map_or(0, |e| e.sequence_nr),
        };
        check_next(current, event)?;

        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let line = serde_json::to_string(event)?;
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        writeln!(file, "{line}")?;
        file.sync_data()?;

        highest.insert(path, event.sequence_nr);
        Ok(())
    }

    fn read(
        &self,
        persistence_id: &str,
        entity_id: &str,
        after: u64,
    ) -> Result<Vec<PersistedEvent>, JournalError> {
        Self::read_path(&self.layout.events_path(persistence_id, entity_id), after)
    }

    fn highest_sequence_nr(
        &self,
        persistence_id: &str,
        entity_id: &str,
    ) -> Result<u64, JournalError> {
        let path = self.layout.events_path(persistence_id, entity_id);
        if let Some(n) = self
            .highest
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&path)
        {
            return Ok(*n);
        }
        Ok(Self::read_path(&path, 0)?.last().map_or(0, |e| e.sequence_nr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandContext;
    use crate::event::encode_event;
    use crate::shopping_cart::{CartEvent, ShoppingCart};

    fn added(seq: u64, product_id: &str) -> PersistedEvent {
        let event = CartEvent::ItemAdded {
            product_id: product_id.into(),
            name: "Widget".into(),
            quantity: 1,
        };
        encode_event::<ShoppingCart>(&event, &CommandContext::default(), "cart-1", seq)
            .expect("encode should succeed")
    }

    fn exercise_contract(journal: &dyn Journal) {
        assert_eq!(journal.highest_sequence_nr("carts", "cart-1").unwrap(), 0);
        assert!(journal.read("carts", "cart-1", 0).unwrap().is_empty());

        journal.append("carts", "cart-1", &added(1, "p1")).unwrap();
        journal.append("carts", "cart-1", &added(2, "p2")).unwrap();
        journal.append("carts", "cart-1", &added(3, "p3")).unwrap();

        assert_eq!(journal.highest_sequence_nr("carts", "cart-1").unwrap(), 3);

        let all = journal.read("carts", "cart-1", 0).unwrap();
        let seqs: Vec<u64> = all.iter().map(|e| e.sequence_nr).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        let tail = journal.read("carts", "cart-1", 2).unwrap();
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].payload["productId"], "p3");

        // Streams are independent.
        assert_eq!(journal.highest_sequence_nr("carts", "cart-2").unwrap(), 0);
        assert_eq!(journal.highest_sequence_nr("orders", "cart-1").unwrap(), 0);
    }

    fn exercise_conflict(journal: &dyn Journal) {
        journal.append("carts", "cart-1", &added(1, "p1")).unwrap();

        let duplicate = journal.append("carts", "cart-1", &added(1, "p1"));
        assert!(matches!(
            duplicate,
            Err(JournalError::Conflict {
                expected: 2,
                actual: 1
            })
        ));

        let gap = journal.append("carts", "cart-1", &added(5, "p5"));
        assert!(matches!(
            gap,
            Err(JournalError::Conflict {
                expected: 2,
                actual: 5
            })
        ));

        // Rejected appends leave the stream untouched.
        assert_eq!(journal.read("carts", "cart-1", 0).unwrap().len(), 1);
    }

    #[test]
    fn in_memory_contract() {
        exercise_contract(&InMemoryJournal::new());
    }

    #[test]
    fn in_memory_rejects_out_of_sequence() {
        exercise_conflict(&InMemoryJournal::new());
    }

    #[test]
    fn file_contract() {
        let tmp = tempfile::tempdir().expect("temp dir");
        exercise_contract(&FileJournal::new(tmp.path()));
    }

    #[test]
    fn file_rejects_out_of_sequence() {
        let tmp = tempfile::tempdir().expect("temp dir");
        exercise_conflict(&FileJournal::new(tmp.path()));
    }

    #[test]
    fn file_journal_survives_reopen() {
        let tmp = tempfile::tempdir().expect("temp dir");
        {
            let journal = FileJournal::new(tmp.path());
            journal.append("carts", "cart-1", &added(1, "p1")).unwrap();
            journal.append("carts", "cart-1", &added(2, "p2")).unwrap();
        }

        let reopened = FileJournal::new(tmp.path());
        assert_eq!(reopened.highest_sequence_nr("carts", "cart-1").unwrap(), 2);
        // A fresh instance scans the file before its first append.
        reopened
            .append("carts", "cart-1", &added(3, "p3"))
            .expect("append after reopen should continue the sequence");
        assert!(matches!(
            reopened.append("carts", "cart-1", &added(3, "p3")),
            Err(JournalError::Conflict { .. })
        ));
    }

    #[test]
    fn file_journal_writes_one_json_line_per_event() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let journal = FileJournal::new(tmp.path());
        journal.append("carts", "cart-1", &added(1, "p1")).unwrap();
        journal.append("carts", "cart-1", &added(2, "p2")).unwrap();

        let path = journal.layout().events_path("carts", "cart-1");
        let contents = fs::read_to_string(path).expect("events file should exist");
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 2);
        for line in lines {
            let value: serde_json::Value = serde_json::from_str(line).expect("valid JSON line");
            assert_eq!(value["event_type"], "ItemAdded");
        }
    }

    #[test]
    fn corrupt_line_is_a_codec_error() {
        let tmp = tempfile::tempdir().expect("temp dir");
        let journal = FileJournal::new(tmp.path());
        let path = journal.layout().events_path("carts", "cart-1");
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json\n").unwrap();

        assert!(matches!(
            journal.read("carts", "cart-1", 0),
            Err(JournalError::Codec(_))
        ));
    }
}
