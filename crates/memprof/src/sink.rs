//! Consumers of [`TraceRecord`]s.

use alloc::vec::Vec;
#[cfg(feature = "std")]
use std::io::{BufWriter, Write};

use crate::{records::TraceRecord, Error};

/// Receives every record the profiler emits, in emission order
pub trait TraceSink {
    /// Consume one record
    fn emit(&mut self, record: &TraceRecord) -> Result<(), Error>;

    /// Push buffered records to their destination
    fn flush(&mut self) -> Result<(), Error> {
        Ok(())
    }
}

impl<S> TraceSink for &mut S
where
    S: TraceSink + ?Sized,
{
    fn emit(&mut self, record: &TraceRecord) -> Result<(), Error> {
        (**self).emit(record)
    }

    fn flush(&mut self) -> Result<(), Error> {
        (**self).flush()
    }
}

/// A sink that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NopSink {}

impl NopSink {
    /// Create a new [`NopSink`]
    #[must_use]
    pub fn new() -> Self {
        Self {}
    }
}

impl TraceSink for NopSink {
    fn emit(&mut self, _record: &TraceRecord) -> Result<(), Error> {
        Ok(())
    }
}

/// A sink keeping all records in memory
#[derive(Debug, Default, Clone)]
pub struct VecSink {
    records: Vec<TraceRecord>,
}

impl VecSink {
    /// Create a new, empty [`VecSink`]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records emitted so far
    #[must_use]
    pub fn records(&self) -> &[TraceRecord] {
        &self.records
    }

    /// Take the records emitted so far, leaving the sink empty
    pub fn drain(&mut self) -> Vec<TraceRecord> {
        core::mem::take(&mut self.records)
    }
}

impl TraceSink for VecSink {
    fn emit(&mut self, record: &TraceRecord) -> Result<(), Error> {
        self.records.push(record.clone());
        Ok(())
    }
}

/// Writes each record as one CSV line
#[cfg(feature = "std")]
#[derive(Debug)]
pub struct CsvSink<W>
where
    W: Write,
{
    writer: BufWriter<W>,
    faults: usize,
}

#[cfg(feature = "std")]
impl<W> CsvSink<W>
where
    W: Write,
{
    /// Create a new [`CsvSink`] writing to `writer`
    #[must_use]
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            faults: 0,
        }
    }

    /// Number of merge faults written so far
    #[must_use]
    pub fn faults(&self) -> usize {
        self.faults
    }

    /// Flush and hand back the underlying writer
    pub fn into_inner(self) -> Result<W, Error> {
        self.writer
            .into_inner()
            .map_err(|err| Error::file(err.into_error()))
    }
}

#[cfg(feature = "std")]
impl CsvSink<std::fs::File> {
    /// Create (or truncate) the trace file at `path`
    pub fn create<P>(path: P) -> Result<Self, Error>
    where
        P: AsRef<std::path::Path>,
    {
        Ok(Self::new(std::fs::File::create(path)?))
    }
}

#[cfg(feature = "std")]
impl<W> TraceSink for CsvSink<W>
where
    W: Write,
{
    fn emit(&mut self, record: &TraceRecord) -> Result<(), Error> {
        if record.is_fault() {
            self.faults += 1;
        }
        writeln!(self.writer, "{record}")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Error> {
        self.writer.flush()?;
        Ok(())
    }
}
