//! The external scoring process and its wire formats.
//!
//! Rows go in as either comma-separated lines or length-encoded records. Results come back
//! as a stream of JSON objects, one per input row after the header, in input order.

use serde::Deserialize;
use std::io::{self, BufRead, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use tempfile::TempPath;
use tokio::sync::mpsc;

use crate::config::RenormalizerConfig;
use crate::error::ScoringError;

pub const HEADER: [&str; 7] = [
    "level",
    "partitionFieldName",
    "partitionFieldValue",
    "personFieldName",
    "functionName",
    "valueFieldName",
    "probability",
];

/// Scores arrive as either JSON strings or JSON numbers depending on the process build.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum ScoreValue {
    Number(f64),
    Text(String),
}

impl ScoreValue {
    pub fn to_f64(&self) -> Result<f64, ScoringError> {
        let value = match self {
            ScoreValue::Number(value) => *value,
            ScoreValue::Text(raw) => raw.trim().parse::<f64>().map_err(|_| {
                ScoringError::Protocol(format!("normalized score {raw:?} is not a number"))
            })?,
        };
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ScoringError::Protocol(format!(
                "normalized score {value} is not finite"
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizerResult {
    #[serde(default)]
    pub level: Option<String>,
    #[serde(default)]
    pub partition_field_name: Option<String>,
    #[serde(default)]
    pub partition_field_value: Option<String>,
    #[serde(default)]
    pub person_field_name: Option<String>,
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub value_field_name: Option<String>,
    #[serde(default)]
    pub probability: Option<ScoreValue>,
    pub normalized_score: ScoreValue,
}

impl NormalizerResult {
    pub fn with_score(score: f64) -> Self {
        Self {
            level: None,
            partition_field_name: None,
            partition_field_value: None,
            person_field_name: None,
            function_name: None,
            value_field_name: None,
            probability: None,
            normalized_score: ScoreValue::Number(score),
        }
    }

    pub fn score(&self) -> Result<f64, ScoringError> {
        self.normalized_score.to_f64()
    }
}

/// Decodes concatenated JSON results. The first malformed document ends the stream.
pub fn parse_results<R: Read>(
    reader: R,
) -> impl Iterator<Item = Result<NormalizerResult, ScoringError>> {
    let mut failed = false;
    serde_json::Deserializer::from_reader(reader)
        .into_iter::<NormalizerResult>()
        .map(|item| {
            item.map_err(|err| ScoringError::Protocol(format!("malformed result: {err}")))
        })
        .take_while(move |item| {
            let keep = !failed;
            failed = item.is_err();
            keep
        })
}

/// A started scoring process: one write phase, then one read phase.
pub trait ScoringProcess: Send {
    fn write_record(&mut self, fields: &[&str]) -> Result<(), ScoringError>;

    /// Signals end of input. Results may not be complete before this is called.
    fn close_input(&mut self) -> Result<(), ScoringError>;

    /// `Ok(None)` once the process has no more results.
    fn read_result(&mut self) -> Result<Option<NormalizerResult>, ScoringError>;

    fn close(self: Box<Self>) -> Result<(), ScoringError>;
}

pub trait ScoringProcessFactory: Send + Sync {
    fn create(
        &self,
        job_id: &str,
        quantiles_state: &str,
        bucket_span_seconds: u64,
    ) -> Result<Box<dyn ScoringProcess>, ScoringError>;
}

pub trait RowWriter: Send {
    fn write_row(&mut self, fields: &[&str]) -> io::Result<()>;

    /// Flushes and drops the underlying stream.
    fn finish(self: Box<Self>) -> io::Result<()>;
}

pub struct CsvRowWriter<W: Write> {
    inner: csv::Writer<W>,
}

impl<W: Write> CsvRowWriter<W> {
    pub fn new(writer: W) -> Self {
        let inner = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(writer);
        Self { inner }
    }

    pub fn into_inner(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|err| err.into_error())
    }
}

impl<W: Write + Send> RowWriter for CsvRowWriter<W> {
    fn write_row(&mut self, fields: &[&str]) -> io::Result<()> {
        self.inner.write_record(fields)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Big-endian `u32` field count, then each field as a `u32` byte length and its UTF-8 bytes.
pub struct LengthEncodedRowWriter<W: Write> {
    inner: W,
}

impl<W: Write> LengthEncodedRowWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    fn write_len(&mut self, len: usize) -> io::Result<()> {
        let len = u32::try_from(len)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "field too long"))?;
        self.inner.write_all(&len.to_be_bytes())
    }
}

impl<W: Write + Send> RowWriter for LengthEncodedRowWriter<W> {
    fn write_row(&mut self, fields: &[&str]) -> io::Result<()> {
        self.write_len(fields.len())?;
        for field in fields {
            self.write_len(field.len())?;
            self.inner.write_all(field.as_bytes())?;
        }
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Launches the native `normalize` executable once per renormalization chunk.
#[derive(Debug, Clone)]
pub struct NativeScoringProcessFactory {
    binary: PathBuf,
    tmp_dir: Option<PathBuf>,
    length_encoded_input: bool,
    per_partition: bool,
}

impl NativeScoringProcessFactory {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            tmp_dir: None,
            length_encoded_input: false,
            per_partition: false,
        }
    }

    pub fn from_config(config: &RenormalizerConfig, per_partition: bool) -> Self {
        Self {
            binary: config.scoring_binary.clone(),
            tmp_dir: config.tmp_dir.clone(),
            length_encoded_input: config.length_encoded_input,
            per_partition,
        }
    }

    pub fn with_tmp_dir(mut self, tmp_dir: impl Into<PathBuf>) -> Self {
        self.tmp_dir = Some(tmp_dir.into());
        self
    }

    pub fn with_length_encoded_input(mut self, enabled: bool) -> Self {
        self.length_encoded_input = enabled;
        self
    }

    pub fn with_per_partition(mut self, enabled: bool) -> Self {
        self.per_partition = enabled;
        self
    }

    fn command_args(
        &self,
        job_id: &str,
        bucket_span_seconds: u64,
        state_file: Option<&Path>,
    ) -> Vec<String> {
        let mut args = vec![
            format!("--bucketspan={bucket_span_seconds}"),
            format!("--logid={job_id}"),
        ];
        if self.length_encoded_input {
            args.push("--lengthEncodedInput".to_string());
        }
        if self.per_partition {
            args.push("--perPartitionNormalization".to_string());
        }
        if let Some(path) = state_file {
            args.push(format!("--quantilesState={}", path.display()));
            args.push("--deleteStateFiles".to_string());
        }
        args
    }

    fn write_state_file(&self, job_id: &str, quantiles_state: &str) -> io::Result<TempPath> {
        let prefix = format!("{job_id}_quantiles_");
        let mut builder = tempfile::Builder::new();
        builder.prefix(&prefix).suffix(".json");
        let mut file = match &self.tmp_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempfile_in(dir)?
            }
            None => builder.tempfile()?,
        };
        file.write_all(quantiles_state.as_bytes())?;
        file.flush()?;
        Ok(file.into_temp_path())
    }
}

impl ScoringProcessFactory for NativeScoringProcessFactory {
    fn create(
        &self,
        job_id: &str,
        quantiles_state: &str,
        bucket_span_seconds: u64,
    ) -> Result<Box<dyn ScoringProcess>, ScoringError> {
        let state_file = if quantiles_state.is_empty() {
            None
        } else {
            Some(self.write_state_file(job_id, quantiles_state)?)
        };
        let args = self.command_args(job_id, bucket_span_seconds, state_file.as_deref());

        let mut child = Command::new(&self.binary)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ScoringError::ProcessStart {
                job_id: job_id.to_string(),
                source,
            })?;
        tracing::debug!(
            job_id = %job_id,
            binary = %self.binary.display(),
            args = ?args,
            "spawned scoring process"
        );

        match NativeScoringProcess::attach(job_id, &mut child, self.length_encoded_input) {
            Ok((writer, results, reader_thread, stderr_thread)) => {
                Ok(Box::new(NativeScoringProcess {
                    job_id: job_id.to_string(),
                    child,
                    writer: Some(writer),
                    results,
                    reader_thread: Some(reader_thread),
                    stderr_thread: Some(stderr_thread),
                    _state_file: state_file,
                    closed: false,
                }))
            }
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                Err(err)
            }
        }
    }
}

type ResultReceiver = mpsc::UnboundedReceiver<Result<NormalizerResult, ScoringError>>;

pub struct NativeScoringProcess {
    job_id: String,
    child: Child,
    writer: Option<Box<dyn RowWriter>>,
    results: ResultReceiver,
    reader_thread: Option<JoinHandle<()>>,
    stderr_thread: Option<JoinHandle<()>>,
    // Removed on drop if the process did not delete it itself.
    _state_file: Option<TempPath>,
    closed: bool,
}

impl NativeScoringProcess {
    #[allow(clippy::type_complexity)]
    fn attach(
        job_id: &str,
        child: &mut Child,
        length_encoded_input: bool,
    ) -> Result<(Box<dyn RowWriter>, ResultReceiver, JoinHandle<()>, JoinHandle<()>), ScoringError>
    {
        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| missing_pipe("stderr"))?;

        let writer: Box<dyn RowWriter> = if length_encoded_input {
            Box::new(LengthEncodedRowWriter::new(BufWriter::new(stdin)))
        } else {
            Box::new(CsvRowWriter::new(stdin))
        };

        // Results are drained on their own thread so a large chunk cannot fill the stdout
        // pipe while rows are still being written.
        let (tx, results) = mpsc::unbounded_channel();
        let reader_thread = std::thread::Builder::new()
            .name(format!("{job_id}-normalize-out"))
            .spawn(move || {
                for item in parse_results(BufReader::new(stdout)) {
                    if tx.send(item).is_err() {
                        break;
                    }
                }
            })?;

        let log_job_id = job_id.to_string();
        let stderr_thread = std::thread::Builder::new()
            .name(format!("{job_id}-normalize-err"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if line.trim().is_empty() => {}
                        Ok(line) => {
                            tracing::warn!(job_id = %log_job_id, line = %line, "scoring process stderr")
                        }
                        Err(_) => break,
                    }
                }
            })?;

        Ok((writer, results, reader_thread, stderr_thread))
    }
}

fn missing_pipe(name: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("scoring process {name} is not piped"),
    )
}

impl ScoringProcess for NativeScoringProcess {
    fn write_record(&mut self, fields: &[&str]) -> Result<(), ScoringError> {
        let writer = self.writer.as_mut().ok_or_else(|| {
            ScoringError::Protocol("row written after input was closed".to_string())
        })?;
        writer.write_row(fields)?;
        Ok(())
    }

    fn close_input(&mut self) -> Result<(), ScoringError> {
        if let Some(writer) = self.writer.take() {
            writer.finish()?;
        }
        Ok(())
    }

    fn read_result(&mut self) -> Result<Option<NormalizerResult>, ScoringError> {
        self.results.blocking_recv().transpose()
    }

    fn close(mut self: Box<Self>) -> Result<(), ScoringError> {
        self.close_input()?;
        let status = self.child.wait()?;
        self.closed = true;
        for handle in [self.reader_thread.take(), self.stderr_thread.take()]
            .into_iter()
            .flatten()
        {
            if handle.join().is_err() {
                tracing::warn!(job_id = %self.job_id, "scoring process reader thread panicked");
            }
        }
        if !status.success() {
            tracing::warn!(job_id = %self.job_id, status = %status, "scoring process exited with failure");
        }
        Ok(())
    }
}

impl Drop for NativeScoringProcess {
    fn drop(&mut self) {
        if !self.closed {
            self.writer.take();
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}
