use std::collections::VecDeque;
use std::path::PathBuf;

use tracing::debug;

use crate::config::ShuffleConfig;
use crate::error::{Result, ShuffleError};
use crate::part::{PartFile, PartReader, PartWriter, part_path, remove_parts};

/// Lifecycle of a shuffle run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Append-only; `run()` may spill.
    Writing,
    /// Spilling is over; the run can be read once.
    Reading,
    /// Temporary files removed.
    Done,
}

/// Unkeyed spill area. Values come back in insertion order: every part in
/// the order it was written, then whatever was still in memory.
pub struct RunMerger {
    name: String,
    dir: PathBuf,
    config: ShuffleConfig,
    state: RunState,
    records: Vec<Vec<u8>>,
    bytes_in_memory: usize,
    parts: Vec<PartFile>,
    consumed: bool,
}

impl RunMerger {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, config: ShuffleConfig) -> Self {
        Self {
            name: name.into(),
            dir: dir.into(),
            config,
            state: RunState::Writing,
            records: Vec::new(),
            bytes_in_memory: 0,
            parts: Vec::new(),
            consumed: false,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn parts(&self) -> &[PartFile] {
        &self.parts
    }

    pub fn add(&mut self, value: Vec<u8>) -> Result<()> {
        if self.state != RunState::Writing {
            return Err(ShuffleError::AddAfterReading {
                name: self.name.clone(),
            });
        }
        self.bytes_in_memory += value.len();
        self.records.push(value);
        Ok(())
    }

    /// Spill the in-memory records when a threshold is exceeded. Returns
    /// whether a part was written.
    pub fn run(&mut self) -> Result<bool> {
        if self.state != RunState::Writing
            || !self
                .config
                .over_threshold(self.bytes_in_memory, self.records.len())
        {
            return Ok(false);
        }
        self.spill()?;
        Ok(true)
    }

    fn spill(&mut self) -> Result<()> {
        let path = part_path(&self.dir, &self.name, self.parts.len());
        let mut writer = PartWriter::create(path)?;
        for value in self.records.drain(..) {
            writer.write_value(&value)?;
        }
        let part = writer.finish()?;
        debug!(
            run = %self.name,
            part = self.parts.len(),
            records = part.records,
            bytes = part.bytes,
            "spilled run"
        );
        self.parts.push(part);
        self.bytes_in_memory = 0;
        Ok(())
    }

    pub fn switch_to_reading(&mut self) -> Result<()> {
        match self.state {
            RunState::Writing => {
                self.state = RunState::Reading;
                Ok(())
            }
            RunState::Reading => Ok(()),
            RunState::Done => Err(ShuffleError::Cleaned {
                name: self.name.clone(),
            }),
        }
    }

    /// Hand every record to a single-pass reader. The reader owns the part
    /// files from here on and deletes them when dropped.
    pub fn read_iterator(&mut self) -> Result<RunValues> {
        match self.state {
            RunState::Writing => {
                return Err(ShuffleError::NotReading {
                    name: self.name.clone(),
                });
            }
            RunState::Done => {
                return Err(ShuffleError::Cleaned {
                    name: self.name.clone(),
                });
            }
            RunState::Reading => {}
        }
        if self.consumed {
            return Err(ShuffleError::AlreadyConsumed {
                name: self.name.clone(),
            });
        }
        self.consumed = true;
        self.bytes_in_memory = 0;
        Ok(RunValues {
            window_records: self.config.read_window_records.max(1),
            parts: self.parts.clone(),
            next_part: 0,
            reader: None,
            window: VecDeque::new(),
            memory: std::mem::take(&mut self.records).into(),
            failed: false,
        })
    }

    /// Delete every part file and mark the run done. Safe to repeat.
    pub fn clean(&mut self) -> Result<()> {
        remove_parts(&self.parts)?;
        self.records.clear();
        self.bytes_in_memory = 0;
        self.state = RunState::Done;
        Ok(())
    }
}

impl Drop for RunMerger {
    fn drop(&mut self) {
        if !self.consumed && !self.parts.is_empty() {
            let _ = remove_parts(&self.parts);
        }
    }
}

/// Lazy reader over an unkeyed run.
pub struct RunValues {
    window_records: usize,
    parts: Vec<PartFile>,
    next_part: usize,
    reader: Option<PartReader>,
    window: VecDeque<Vec<u8>>,
    memory: VecDeque<Vec<u8>>,
    failed: bool,
}

impl RunValues {
    fn advance(&mut self) -> Result<Option<Vec<u8>>> {
        loop {
            if let Some(v) = self.window.pop_front() {
                return Ok(Some(v));
            }
            match self.reader.as_mut() {
                Some(reader) if !reader.is_exhausted() => {
                    reader.read_values(self.window_records, &mut self.window)?;
                }
                _ => {
                    self.reader = None;
                    match self.parts.get(self.next_part) {
                        Some(part) => {
                            self.reader = Some(PartReader::new(part));
                            self.next_part += 1;
                        }
                        None => return Ok(self.memory.pop_front()),
                    }
                }
            }
        }
    }
}

impl Iterator for RunValues {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.advance() {
            Ok(v) => v.map(Ok),
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

impl Drop for RunValues {
    fn drop(&mut self) {
        self.reader = None;
        let _ = remove_parts(&self.parts);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> ShuffleConfig {
        ShuffleConfig {
            max_bytes_in_memory: 16,
            max_records_in_memory: 1000,
            read_window_records: 3,
        }
    }

    #[test]
    fn test_insertion_order_across_spills() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunMerger::new(dir.path(), "edge-1", small());
        for i in 0..20u32 {
            run.add(i.to_le_bytes().to_vec()).unwrap();
            run.run().unwrap();
        }
        assert!(run.parts().len() >= 2);
        run.switch_to_reading().unwrap();

        let values: Vec<u32> = run
            .read_iterator()
            .unwrap()
            .map(|v| u32::from_le_bytes(v.unwrap().try_into().unwrap()))
            .collect();
        assert_eq!(values, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_run_under_threshold_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunMerger::new(dir.path(), "quiet", small());
        run.add(vec![1, 2, 3]).unwrap();
        assert!(!run.run().unwrap());
        assert!(!run.run().unwrap());
        assert!(run.parts().is_empty());
    }

    #[test]
    fn test_add_after_reading_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunMerger::new(dir.path(), "closed", small());
        run.switch_to_reading().unwrap();
        let err = run.add(vec![0]).unwrap_err();
        assert!(matches!(err, ShuffleError::AddAfterReading { .. }));
    }

    #[test]
    fn test_read_requires_reading_state_and_is_single_pass() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunMerger::new(dir.path(), "once", small());
        assert!(matches!(
            run.read_iterator(),
            Err(ShuffleError::NotReading { .. })
        ));
        run.switch_to_reading().unwrap();
        let _ = run.read_iterator().unwrap();
        assert!(matches!(
            run.read_iterator(),
            Err(ShuffleError::AlreadyConsumed { .. })
        ));
    }

    #[test]
    fn test_reader_removes_parts_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunMerger::new(dir.path(), "tmp", small());
        for _ in 0..8 {
            run.add(vec![7; 8]).unwrap();
            run.run().unwrap();
        }
        let paths: Vec<_> = run.parts().iter().map(|p| p.path.clone()).collect();
        assert!(!paths.is_empty());
        run.switch_to_reading().unwrap();
        let mut values = run.read_iterator().unwrap();
        assert!(values.next().is_some());
        drop(values);
        assert!(paths.iter().all(|p| !p.exists()));
    }

    #[test]
    fn test_clean_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let mut run = RunMerger::new(dir.path(), "twice", small());
        for _ in 0..4 {
            run.add(vec![1; 10]).unwrap();
            run.run().unwrap();
        }
        run.clean().unwrap();
        run.clean().unwrap();
        assert_eq!(run.state(), RunState::Done);
        assert!(run.parts().iter().all(|p| !p.path.exists()));
    }
}
