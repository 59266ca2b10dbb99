//! The append-only, crash-safe results journal.
//!
//! One JSON object per `\n`-terminated line, so a process killed mid-write
//! leaves at most one truncated trailing record, which the reader simply
//! drops rather than treating as corruption.

use std::collections::BTreeMap;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::JournalError;
use crate::model::{TestId, TestStatus};

type ReplayState = (
    BTreeMap<TestId, (TestStatus, Option<i32>)>,
    BTreeMap<TestId, DateTime<Utc>>,
);

/// A single journal line. `Start` is written when a test begins running,
/// `Finish` when it reaches a terminal status, `Include` references another
/// journal file whose records should be folded in (used when a batch job's
/// own journal is merged back into the top-level one).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Record {
    Start {
        id: TestId,
        at: DateTime<Utc>,
    },
    Finish {
        id: TestId,
        at: DateTime<Utc>,
        status: TestStatus,
        exit_value: Option<i32>,
    },
    Include {
        path: PathBuf,
    },
}

/// An in-memory view over the records read so far, plus an open handle for
/// appending more. Tolerant of a truncated trailing line (a crash mid-write
/// leaves a partial JSON object, which is simply dropped rather than
/// treated as corruption).
pub struct Journal {
    path: PathBuf,
    file: std::fs::File,
    terminal: BTreeMap<TestId, (TestStatus, Option<i32>)>,
    /// Tests with a `Start` record and no matching `Finish` yet, as of the
    /// last replay — what a mid-run observer (a separate process opening the
    /// same path read-only and calling `reload()` on a timer) uses to show
    /// "currently running" rather than only final results.
    running: BTreeMap<TestId, DateTime<Utc>>,
}

impl Journal {
    /// Open (creating if necessary) the journal at `path`, replaying any
    /// existing records into memory.
    pub fn open(path: &Path) -> Result<Self, JournalError> {
        let (terminal, running) = Self::replay(path)?;

        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|source| JournalError::Open {
                path: path.to_path_buf(),
                source,
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            terminal,
            running,
        })
    }

    /// Re-read the journal file from scratch, picking up any records another
    /// process (a batch child sharing this journal path, or this run's own
    /// writer, for an observer that opened the file separately) appended
    /// since this handle was opened or last reloaded.
    pub fn reload(&mut self) -> Result<(), JournalError> {
        let (terminal, running) = Self::replay(&self.path)?;
        self.terminal = terminal;
        self.running = running;
        Ok(())
    }

    fn replay(path: &Path) -> Result<ReplayState, JournalError> {
        let mut terminal = BTreeMap::new();
        let mut running = BTreeMap::new();
        if path.exists() {
            let existing = std::fs::File::open(path).map_err(|source| JournalError::Open {
                path: path.to_path_buf(),
                source,
            })?;
            for line in std::io::BufReader::new(existing).lines() {
                let line = line.map_err(JournalError::Io)?;
                if line.trim().is_empty() {
                    continue;
                }
                let Ok(record) = serde_json::from_str::<Record>(&line) else {
                    // Truncated trailing record from a crash mid-write; the
                    // rest of the file is still valid, so just stop here
                    // rather than erroring the whole journal out.
                    break;
                };
                Self::apply(&mut terminal, &mut running, record, path)?;
            }
        }
        Ok((terminal, running))
    }

    fn apply(
        terminal: &mut BTreeMap<TestId, (TestStatus, Option<i32>)>,
        running: &mut BTreeMap<TestId, DateTime<Utc>>,
        record: Record,
        journal_path: &Path,
    ) -> Result<(), JournalError> {
        match record {
            Record::Start { id, at } => {
                running.insert(id, at);
            }
            Record::Finish { id, status, exit_value, .. } => {
                running.remove(&id);
                terminal.insert(id, (status, exit_value));
            }
            Record::Include { path } => {
                let resolved = if path.is_absolute() {
                    path
                } else {
                    journal_path
                        .parent()
                        .map(|p| p.join(&path))
                        .unwrap_or(path)
                };
                let included = Journal::open(&resolved)?;
                terminal.extend(included.terminal);
                running.extend(included.running);
                for id in terminal.keys() {
                    running.remove(id);
                }
            }
        }
        Ok(())
    }

    pub fn append_start(&mut self, id: &TestId) -> Result<(), JournalError> {
        self.write_record(&Record::Start {
            id: id.clone(),
            at: Utc::now(),
        })
    }

    pub fn append_finish(
        &mut self,
        id: &TestId,
        status: TestStatus,
        exit_value: Option<i32>,
    ) -> Result<(), JournalError> {
        self.terminal.insert(id.clone(), (status, exit_value));
        self.write_record(&Record::Finish {
            id: id.clone(),
            at: Utc::now(),
            status,
            exit_value,
        })
    }

    pub fn append_include(&mut self, path: &Path) -> Result<(), JournalError> {
        self.write_record(&Record::Include {
            path: path.to_path_buf(),
        })
    }

    fn write_record(&mut self, record: &Record) -> Result<(), JournalError> {
        let line = serde_json::to_string(record)
            .map_err(|e| JournalError::Malformed(e.to_string()))?;
        writeln!(self.file, "{line}").map_err(JournalError::Io)?;
        self.file.flush().map_err(JournalError::Io)?;
        Ok(())
    }

    pub fn has_terminal_record(&self, id: &TestId) -> bool {
        self.terminal.contains_key(id)
    }

    /// Whether `id` has any record at all, started or finished — used to
    /// distinguish a test a batch job never even launched from one that ran
    /// but never reported a clean finish.
    pub fn has_any_record(&self, id: &TestId) -> bool {
        self.running.contains_key(id) || self.terminal.contains_key(id)
    }

    pub fn terminal_status(&self, id: &TestId) -> Option<TestStatus> {
        self.terminal.get(id).map(|(s, _)| *s)
    }

    /// Tests with a `Start` record and no terminal record yet, as of the
    /// last `open`/`reload`, with the timestamp they started at. A separate
    /// process can use this (alongside `terminal_status`) to show live
    /// progress for a run it isn't driving — open the same journal path
    /// read-only and call `reload` on a timer.
    pub fn running(&self) -> impl Iterator<Item = (&TestId, &DateTime<Utc>)> {
        self.running.iter()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_finish_roundtrips_through_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let id = TestId::new("a", [], None);
        {
            let mut j = Journal::open(&path).unwrap();
            j.append_start(&id).unwrap();
            j.append_finish(&id, TestStatus::Pass, Some(0)).unwrap();
        }
        let reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.terminal_status(&id), Some(TestStatus::Pass));
    }

    #[test]
    fn reload_picks_up_records_appended_by_another_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let id = TestId::new("a", [], None);

        let mut reader = Journal::open(&path).unwrap();
        assert!(!reader.has_terminal_record(&id));

        {
            let mut writer = Journal::open(&path).unwrap();
            writer.append_finish(&id, TestStatus::Pass, Some(0)).unwrap();
        }

        assert!(!reader.has_terminal_record(&id));
        reader.reload().unwrap();
        assert_eq!(reader.terminal_status(&id), Some(TestStatus::Pass));
    }

    #[test]
    fn running_reflects_started_but_unfinished_tests() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let a = TestId::new("a", [], None);
        let b = TestId::new("b", [], None);

        let mut observer = Journal::open(&path).unwrap();
        assert_eq!(observer.running().count(), 0);

        {
            let mut writer = Journal::open(&path).unwrap();
            writer.append_start(&a).unwrap();
            writer.append_start(&b).unwrap();
            writer.append_finish(&a, TestStatus::Pass, Some(0)).unwrap();
        }

        observer.reload().unwrap();
        let running: Vec<&TestId> = observer.running().map(|(id, _)| id).collect();
        assert_eq!(running, vec![&b]);
        assert_eq!(observer.terminal_status(&a), Some(TestStatus::Pass));
    }

    #[test]
    fn truncated_trailing_line_is_ignored_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.jsonl");
        let id = TestId::new("a", [], None);
        {
            let mut j = Journal::open(&path).unwrap();
            j.append_finish(&id, TestStatus::Pass, Some(0)).unwrap();
        }
        {
            let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
            write!(f, "{{\"kind\":\"Finish\",\"id\":{{\"name\":\"b\"").unwrap();
        }
        let reopened = Journal::open(&path).unwrap();
        assert_eq!(reopened.terminal_status(&id), Some(TestStatus::Pass));
        assert!(!reopened.has_terminal_record(&TestId::new("b", [], None)));
    }
}
