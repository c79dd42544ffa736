use std::collections::VecDeque;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::DataType;
use glob::Pattern;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use parquet::arrow::ProjectionMask;
use serde_json::Value;
use walkdir::WalkDir;

use crate::error::{Result, SpoolError};

pub type Batch = Vec<String>;

pub const DEFAULT_BATCH_ROWS: usize = 8192;
pub const DEFAULT_TEXT_FIELD: &str = "content";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputFormat {
    Parquet,
    Jsonl,
    Text,
}

impl InputFormat {
    pub fn default_pattern(self) -> &'static str {
        match self {
            InputFormat::Parquet => "*.parquet",
            InputFormat::Jsonl => "*.jsonl",
            InputFormat::Text => "*.txt",
        }
    }
}

impl FromStr for InputFormat {
    type Err = SpoolError;

    fn from_str(value: &str) -> Result<Self> {
        match value.to_lowercase().as_str() {
            "parquet" | "pq" => Ok(InputFormat::Parquet),
            "jsonl" | "ndjson" | "json" => Ok(InputFormat::Jsonl),
            "text" | "txt" => Ok(InputFormat::Text),
            other => Err(SpoolError::Input(format!("unknown input format {other}"))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SourceOptions {
    pub format: InputFormat,
    pub batch_rows: usize,
    pub field: String,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            format: InputFormat::Parquet,
            batch_rows: DEFAULT_BATCH_ROWS,
            field: DEFAULT_TEXT_FIELD.to_string(),
        }
    }
}

pub fn discover_inputs(root: &Path, patterns: &str) -> Result<Vec<PathBuf>> {
    if root.is_file() {
        return Ok(vec![root.to_path_buf()]);
    }
    if !root.is_dir() {
        return Err(SpoolError::Input(format!(
            "input path {} does not exist",
            root.display()
        )));
    }
    let matchers = patterns
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| {
            Pattern::new(p).map_err(|e| SpoolError::Input(format!("invalid pattern {p}: {e}")))
        })
        .collect::<Result<Vec<_>>>()?;

    let mut files = Vec::new();
    for entry in WalkDir::new(root).sort_by_file_name() {
        let entry = entry.map_err(|e| SpoolError::Input(e.to_string()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if matchers.is_empty() || matchers.iter().any(|m| m.matches(&name)) {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

pub fn open_source(
    files: Vec<PathBuf>,
    opts: &SourceOptions,
) -> Box<dyn Iterator<Item = Result<Batch>>> {
    match opts.format {
        InputFormat::Parquet => {
            Box::new(ParquetSource::new(files, &opts.field, opts.batch_rows))
        }
        InputFormat::Jsonl => Box::new(JsonlSource::new(files, &opts.field, opts.batch_rows)),
        InputFormat::Text => Box::new(TextSource::new(files, opts.batch_rows)),
    }
}

pub fn memory_source<I, S>(docs: I, batch_rows: usize) -> impl Iterator<Item = Result<Batch>>
where
    I: IntoIterator<Item = Option<S>>,
    S: Into<String>,
{
    let batch_rows = batch_rows.max(1);
    let mut docs = docs
        .into_iter()
        .filter_map(|doc| doc.map(Into::<String>::into))
        .filter(|doc| !doc.is_empty())
        .peekable();
    std::iter::from_fn(move || {
        docs.peek()?;
        Some(Ok(docs.by_ref().take(batch_rows).collect()))
    })
}

struct OpenFile {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
}

pub struct JsonlSource {
    pending: VecDeque<PathBuf>,
    current: Option<OpenFile>,
    field: String,
    batch_rows: usize,
    failed: bool,
}

impl JsonlSource {
    pub fn new(files: Vec<PathBuf>, field: &str, batch_rows: usize) -> Self {
        Self {
            pending: files.into(),
            current: None,
            field: field.to_string(),
            batch_rows: batch_rows.max(1),
            failed: false,
        }
    }

    fn next_line(&mut self) -> Result<Option<(String, PathBuf, usize)>> {
        loop {
            if self.current.is_none() {
                let Some(path) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let file = File::open(&path).map_err(|e| {
                    SpoolError::Input(format!("failed to open {}: {e}", path.display()))
                })?;
                self.current = Some(OpenFile {
                    path,
                    lines: BufReader::new(file).lines(),
                    line_no: 0,
                });
            }
            let Some(open) = self.current.as_mut() else {
                continue;
            };
            match open.lines.next() {
                Some(Ok(line)) => {
                    open.line_no += 1;
                    return Ok(Some((line, open.path.clone(), open.line_no)));
                }
                Some(Err(e)) => {
                    return Err(SpoolError::Input(format!(
                        "failed to read {} line {}: {e}",
                        open.path.display(),
                        open.line_no + 1
                    )))
                }
                None => self.current = None,
            }
        }
    }

    fn extract(&self, line: &str, path: &Path, line_no: usize) -> Result<Option<String>> {
        let value: Value = serde_json::from_str(line).map_err(|e| {
            SpoolError::Input(format!("{}:{line_no}: invalid json: {e}", path.display()))
        })?;
        match value.get(&self.field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) if text.is_empty() => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.clone())),
            Some(other) => Err(SpoolError::Input(format!(
                "{}:{line_no}: field {:?} is not a string (found {})",
                path.display(),
                self.field,
                json_kind(other)
            ))),
        }
    }

    fn fill_batch(&mut self) -> Result<Option<Batch>> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_rows {
            let Some((line, path, line_no)) = self.next_line()? else {
                break;
            };
            if line.trim().is_empty() {
                continue;
            }
            if let Some(text) = self.extract(&line, &path, line_no)? {
                batch.push(text);
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }
}

impl Iterator for JsonlSource {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.fill_batch() {
            Ok(batch) => batch.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

pub struct ParquetSource {
    pending: VecDeque<PathBuf>,
    current: Option<(PathBuf, ParquetRecordBatchReader)>,
    field: String,
    batch_rows: usize,
    failed: bool,
}

impl ParquetSource {
    pub fn new(files: Vec<PathBuf>, field: &str, batch_rows: usize) -> Self {
        Self {
            pending: files.into(),
            current: None,
            field: field.to_string(),
            batch_rows: batch_rows.max(1),
            failed: false,
        }
    }

    fn open(&self, path: &Path) -> Result<ParquetRecordBatchReader> {
        let file = File::open(path).map_err(|e| {
            SpoolError::Input(format!("failed to open {}: {e}", path.display()))
        })?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file).map_err(|e| {
            SpoolError::Input(format!("{}: invalid parquet: {e}", path.display()))
        })?;
        let leaf = builder
            .parquet_schema()
            .columns()
            .iter()
            .position(|column| column.path().string() == self.field)
            .ok_or_else(|| {
                SpoolError::Input(format!(
                    "{}: no column named {:?}",
                    path.display(),
                    self.field
                ))
            })?;
        let mask = ProjectionMask::leaves(builder.parquet_schema(), [leaf]);
        builder
            .with_projection(mask)
            .with_batch_size(self.batch_rows)
            .build()
            .map_err(|e| SpoolError::Input(format!("{}: {e}", path.display())))
    }

    fn fill_batch(&mut self) -> Result<Option<Batch>> {
        loop {
            if self.current.is_none() {
                let Some(path) = self.pending.pop_front() else {
                    return Ok(None);
                };
                let reader = self.open(&path)?;
                self.current = Some((path, reader));
            }
            let Some((path, reader)) = self.current.as_mut() else {
                continue;
            };
            match reader.next() {
                Some(Ok(record_batch)) => {
                    let texts = string_values(record_batch.column(0), path, &self.field)?;
                    if !texts.is_empty() {
                        return Ok(Some(texts));
                    }
                }
                Some(Err(e)) => {
                    return Err(SpoolError::Input(format!(
                        "failed to read {}: {e}",
                        path.display()
                    )))
                }
                None => self.current = None,
            }
        }
    }
}

impl Iterator for ParquetSource {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.fill_batch() {
            Ok(batch) => batch.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn string_values(column: &ArrayRef, path: &Path, field: &str) -> Result<Batch> {
    let texts = match column.data_type() {
        DataType::Utf8 => non_empty(column.as_string::<i32>().iter()),
        DataType::LargeUtf8 => non_empty(column.as_string::<i64>().iter()),
        other => {
            return Err(SpoolError::Input(format!(
                "{}: column {field:?} is not a string (found {other:?})",
                path.display()
            )))
        }
    };
    Ok(texts)
}

fn non_empty<'a>(values: impl Iterator<Item = Option<&'a str>>) -> Batch {
    values
        .flatten()
        .filter(|text| !text.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct TextSource {
    pending: VecDeque<PathBuf>,
    batch_rows: usize,
    failed: bool,
}

impl TextSource {
    pub fn new(files: Vec<PathBuf>, batch_rows: usize) -> Self {
        Self {
            pending: files.into(),
            batch_rows: batch_rows.max(1),
            failed: false,
        }
    }

    fn fill_batch(&mut self) -> Result<Option<Batch>> {
        let mut batch = Vec::new();
        while batch.len() < self.batch_rows {
            let Some(path) = self.pending.pop_front() else {
                break;
            };
            let text = fs::read_to_string(&path).map_err(|e| {
                SpoolError::Input(format!("failed to read {}: {e}", path.display()))
            })?;
            if !text.is_empty() {
                batch.push(text);
            }
        }
        Ok(if batch.is_empty() { None } else { Some(batch) })
    }
}

impl Iterator for TextSource {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.fill_batch() {
            Ok(batch) => batch.map(Ok),
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int32Array, Int64Array, StringArray};
    use arrow::datatypes::{Field, Schema};
    use arrow::record_batch::RecordBatch;
    use parquet::arrow::ArrowWriter;
    use std::sync::Arc;
    use tempfile::tempdir;

    fn write_parquet(path: &Path, content: ArrayRef) {
        let ids: ArrayRef = Arc::new(Int64Array::from_iter_values(0..content.len() as i64));
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("content", content.data_type().clone(), true),
        ]));
        let batch = RecordBatch::try_new(schema.clone(), vec![ids, content]).unwrap();
        let mut writer = ArrowWriter::try_new(File::create(path).unwrap(), schema, None).unwrap();
        writer.write(&batch).unwrap();
        writer.close().unwrap();
    }

    #[test]
    fn parquet_reads_content_column_and_drops_empties() {
        let dir = tempdir().unwrap();
        let content: ArrayRef = Arc::new(StringArray::from(vec![
            Some("one"),
            None,
            Some(""),
            Some("two"),
            Some("three"),
        ]));
        write_parquet(&dir.path().join("part-0.parquet"), content);
        let content: ArrayRef = Arc::new(StringArray::from(vec![Some("four")]));
        write_parquet(&dir.path().join("part-1.parquet"), content);
        fs::write(dir.path().join("notes.jsonl"), "{}").unwrap();

        let files = discover_inputs(dir.path(), SourceOptions::default().format.default_pattern())
            .unwrap();
        assert_eq!(files.len(), 2);
        let opts = SourceOptions {
            batch_rows: 2,
            ..SourceOptions::default()
        };
        let batches: Vec<Batch> = open_source(files, &opts).map(|b| b.unwrap()).collect();
        assert!(batches.iter().all(|b| !b.is_empty() && b.len() <= 2));
        let docs: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(docs, vec!["one", "two", "three", "four"]);
    }

    #[test]
    fn parquet_rejects_non_string_column() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("numbers.parquet");
        write_parquet(&path, Arc::new(Int32Array::from(vec![1, 2])));
        let mut source = ParquetSource::new(vec![path], "content", 8);
        match source.next() {
            Some(Err(SpoolError::Input(msg))) => assert!(msg.contains("not a string")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(source.next().is_none());
    }

    #[test]
    fn parquet_missing_column_is_an_input_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("part.parquet");
        write_parquet(&path, Arc::new(StringArray::from(vec!["a"])));
        let mut source = ParquetSource::new(vec![path], "body", 8);
        assert!(matches!(source.next(), Some(Err(SpoolError::Input(_)))));
    }

    #[test]
    fn memory_source_drops_empty_entries() {
        let docs = vec![Some("a"), None, Some(""), Some("b"), Some("c")];
        let batches: Vec<Batch> = memory_source(docs, 2).map(|b| b.unwrap()).collect();
        assert_eq!(batches, vec![vec!["a", "b"], vec!["c"]]);
    }

    #[test]
    fn memory_source_of_nothing_yields_no_batches() {
        let docs: Vec<Option<String>> = vec![None, Some(String::new())];
        assert_eq!(memory_source(docs, 4).count(), 0);
    }

    #[test]
    fn jsonl_batches_span_files_in_order() {
        let dir = tempdir().unwrap();
        fs::write(
            dir.path().join("a.jsonl"),
            "{\"content\": \"one\"}\n{\"content\": null}\n\n{\"content\": \"\"}\n{\"content\": \"two\"}\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("b.jsonl"),
            "{\"content\": \"three\", \"id\": 3}\n{\"other\": 1}\n",
        )
        .unwrap();
        fs::write(dir.path().join("notes.md"), "ignored").unwrap();

        let files = discover_inputs(dir.path(), "*.jsonl").unwrap();
        assert_eq!(files.len(), 2);
        let batches: Vec<Batch> = JsonlSource::new(files, "content", 2)
            .map(|b| b.unwrap())
            .collect();
        assert_eq!(batches, vec![vec!["one", "two"], vec!["three"]]);
    }

    #[test]
    fn jsonl_rejects_non_string_field() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{\"content\": \"ok\"}\n{\"content\": 42}\n").unwrap();
        let mut source = JsonlSource::new(vec![path], "content", 10);
        let err = source.next().unwrap().unwrap_err();
        assert!(err.to_string().contains(":2: field"));
        assert!(source.next().is_none());
    }

    #[test]
    fn jsonl_rejects_malformed_lines() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.jsonl");
        fs::write(&path, "{not json}\n").unwrap();
        let mut source = JsonlSource::new(vec![path], "content", 10);
        assert!(matches!(source.next(), Some(Err(SpoolError::Input(_)))));
    }

    #[test]
    fn text_source_reads_one_document_per_file() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("01.txt"), "first").unwrap();
        fs::write(dir.path().join("02.txt"), "").unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        fs::write(dir.path().join("nested").join("03.txt"), "third").unwrap();

        let files = discover_inputs(dir.path(), InputFormat::Text.default_pattern()).unwrap();
        let opts = SourceOptions {
            format: InputFormat::Text,
            batch_rows: 8,
            ..SourceOptions::default()
        };
        let batches: Vec<Batch> = open_source(files, &opts).map(|b| b.unwrap()).collect();
        assert_eq!(batches, vec![vec!["first", "third"]]);
    }

    #[test]
    fn missing_input_is_an_input_error() {
        let dir = tempdir().unwrap();
        let err = discover_inputs(&dir.path().join("nope"), "*").unwrap_err();
        assert!(matches!(err, SpoolError::Input(_)));
    }

    #[test]
    fn format_names_parse() {
        assert_eq!("JSONL".parse::<InputFormat>().unwrap(), InputFormat::Jsonl);
        assert_eq!("txt".parse::<InputFormat>().unwrap(), InputFormat::Text);
        assert_eq!("parquet".parse::<InputFormat>().unwrap(), InputFormat::Parquet);
        assert!("csv".parse::<InputFormat>().is_err());
    }
}
