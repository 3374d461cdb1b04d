//! Destinations for emitted records.
//!
//! The generation loop writes every record synchronously, before it sleeps,
//! in generation order. A sink that fails to write reports the error; the
//! loop logs it and drops the record.

use std::{
    io::{self, Write},
    sync::{Arc, Mutex, PoisonError},
};

use trafficgen_payload::LogRecord;

/// Errors produced by [`Sink`] implementations.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Wrapper for [`std::io::Error`].
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// Wrapper for [`trafficgen_payload::Error`].
    #[error("Record could not be serialized: {0}")]
    Payload(#[from] trafficgen_payload::Error),
}

/// Somewhere records go.
pub trait Sink: Send {
    /// Write one record.
    ///
    /// # Errors
    ///
    /// Function will error if the record cannot be serialized or written.
    fn write(&mut self, record: &LogRecord) -> Result<(), Error>;
}

/// Writes each record as one JSON line to a [`Write`], flushing per record.
#[derive(Debug)]
pub struct JsonLines<W> {
    writer: W,
}

impl<W> JsonLines<W>
where
    W: Write,
{
    /// Create a new [`JsonLines`] around `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }
}

impl JsonLines<io::Stdout> {
    /// Records to the process' standard output.
    #[must_use]
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W> Sink for JsonLines<W>
where
    W: Write + Send,
{
    fn write(&mut self, record: &LogRecord) -> Result<(), Error> {
        let line = record.to_json_line()?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

/// Keeps records in memory. Clones share the same storage.
#[derive(Debug, Clone, Default)]
pub struct Memory {
    records: Arc<Mutex<Vec<LogRecord>>>,
}

impl Memory {
    /// Create a new, empty, [`Memory`] sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record written so far, in write order.
    #[must_use]
    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Remove and return every record written so far.
    #[must_use]
    pub fn drain(&self) -> Vec<LogRecord> {
        std::mem::take(&mut *self.records.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Sink for Memory {
    fn write(&mut self, record: &LogRecord) -> Result<(), Error> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(())
    }
}
