use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::entity::{mark_entities, Entity};
use crate::error::{DataError, Result};
use crate::labels::{LabelDict, LabelScheme};

/// How a row is turned into encoder input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    /// Sentence with typed markup around both entities.
    #[default]
    Marked,
    /// `subject[SEP]object` paired with the untouched sentence.
    EntityPair,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelInput {
    Single(String),
    Pair(String, String),
}

#[derive(Debug, Deserialize, Serialize)]
struct CsvRecord {
    id: String,
    sentence: String,
    subject_entity: String,
    object_entity: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationRow {
    pub id: String,
    pub sentence: String,
    pub subject: Entity,
    pub object: Entity,
    pub label: Option<String>,
    pub source: Option<String>,
}

impl RelationRow {
    fn from_record(record: CsvRecord) -> Result<Self> {
        let subject = Entity::parse(&record.subject_entity).map_err(|e| e.in_row(&record.id))?;
        let object = Entity::parse(&record.object_entity).map_err(|e| e.in_row(&record.id))?;
        Ok(Self {
            id: record.id,
            sentence: record.sentence,
            subject,
            object,
            label: record.label.filter(|l| !l.is_empty()),
            source: record.source,
        })
    }

    fn to_record(&self) -> CsvRecord {
        CsvRecord {
            id: self.id.clone(),
            sentence: self.sentence.clone(),
            subject_entity: self.subject.to_literal(),
            object_entity: self.object.to_literal(),
            label: self.label.clone(),
            source: self.source.clone(),
        }
    }

    pub fn marked_sentence(&self) -> Result<String> {
        mark_entities(&self.sentence, &self.subject, &self.object).map_err(|e| e.in_row(&self.id))
    }

    pub fn model_input(&self, format: InputFormat) -> Result<ModelInput> {
        match format {
            InputFormat::Marked => self.marked_sentence().map(ModelInput::Single),
            InputFormat::EntityPair => Ok(self.entity_pair()),
        }
    }

    /// Like [`RelationRow::model_input`], but a row whose spans cannot be
    /// marked falls back to the entity pair instead of failing.
    pub fn model_input_or_pair(&self, format: InputFormat) -> ModelInput {
        self.model_input(format).unwrap_or_else(|e| {
            warn!("{}; using the entity pair instead", e);
            self.entity_pair()
        })
    }

    fn entity_pair(&self) -> ModelInput {
        ModelInput::Pair(
            format!("{}[SEP]{}", self.subject.word, self.object.word),
            self.sentence.clone(),
        )
    }
}

/// Reads every row of a KLUE-RE style CSV. Labels are optional.
pub fn read_rows<P: AsRef<Path>>(path: P) -> Result<Vec<RelationRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.deserialize::<CsvRecord>() {
        rows.push(RelationRow::from_record(record?)?);
    }
    Ok(rows)
}

pub fn write_rows<P: AsRef<Path>>(path: P, rows: &[RelationRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row.to_record())?;
    }
    writer.flush()?;
    Ok(())
}

/// Writes `id,sentence,subject_entity,object_entity,label` with marked
/// sentences and bare entity words.
pub fn write_marked<P: AsRef<Path>>(path: P, rows: &[RelationRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(["id", "sentence", "subject_entity", "object_entity", "label"])?;
    for row in rows {
        let marked = row.marked_sentence()?;
        writer.write_record([
            row.id.as_str(),
            marked.as_str(),
            row.subject.word.as_str(),
            row.object.word.as_str(),
            row.label.as_deref().unwrap_or(""),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

/// Labelled rows together with their class ids under a [`LabelScheme`].
#[derive(Debug, Clone)]
pub struct Corpus {
    rows: Vec<RelationRow>,
    labels: Vec<usize>,
    scheme: LabelScheme,
}

impl Corpus {
    pub fn load<P: AsRef<Path>>(path: P, scheme: LabelScheme) -> Result<Self> {
        Self::from_rows(read_rows(path)?, scheme)
    }

    pub fn from_rows(rows: Vec<RelationRow>, scheme: LabelScheme) -> Result<Self> {
        let dict = scheme.dict();
        let mut kept = Vec::with_capacity(rows.len());
        let mut labels = Vec::with_capacity(rows.len());
        let mut dropped = 0;

        for row in rows {
            let label = row
                .label
                .as_deref()
                .ok_or_else(|| DataError::MissingLabel.in_row(&row.id))?;
            if !scheme.accepts(label) {
                dropped += 1;
                continue;
            }
            let id = scheme
                .project(label)
                .and_then(|projected| dict.id(projected))
                .map_err(|e| e.in_row(&row.id))?;
            labels.push(id);
            kept.push(row);
        }
        if dropped > 0 {
            debug!("Dropped {} rows outside the {:?} label scheme", dropped, scheme);
        }

        Ok(Self {
            rows: kept,
            labels,
            scheme,
        })
    }

    pub fn rows(&self) -> &[RelationRow] {
        &self.rows
    }

    pub fn labels(&self) -> &[usize] {
        &self.labels
    }

    pub fn scheme(&self) -> LabelScheme {
        self.scheme
    }

    pub fn dict(&self) -> LabelDict {
        self.scheme.dict()
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Drops rows whose model input cannot be built under `format`, such as
    /// rows with overlapping spans. Returns how many were dropped.
    pub fn drop_unencodable(&mut self, format: InputFormat) -> usize {
        let rows = std::mem::take(&mut self.rows);
        let labels = std::mem::take(&mut self.labels);
        let before = rows.len();
        for (row, label) in rows.into_iter().zip(labels) {
            match row.model_input(format) {
                Ok(_) => {
                    self.rows.push(row);
                    self.labels.push(label);
                }
                Err(e) => warn!("Skipping {}", e),
            }
        }
        before - self.rows.len()
    }

    /// Sub-corpus of the given row indices, in index order.
    pub fn select(&self, idxs: &[usize]) -> Self {
        Self {
            rows: idxs.iter().map(|&i| self.rows[i].clone()).collect(),
            labels: idxs.iter().map(|&i| self.labels[i]).collect(),
            scheme: self.scheme,
        }
    }

    pub fn concat(mut self, other: Corpus) -> Self {
        self.rows.extend(other.rows);
        self.labels.extend(other.labels);
        self
    }

    /// Number of rows per class id, over the whole label space.
    pub fn label_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.scheme.num_labels()];
        for &label in &self.labels {
            counts[label] += 1;
        }
        counts
    }

    pub fn label_histogram(&self) -> BTreeMap<String, usize> {
        let dict = self.dict();
        self.label_counts()
            .into_iter()
            .enumerate()
            .filter(|(_, n)| *n > 0)
            .filter_map(|(id, n)| dict.name(id).ok().map(|name| (name.to_string(), n)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const CSV: &str = "\
id,sentence,subject_entity,object_entity,label,source
0,이순신은 조선의 장군이다.,\"{'word': '이순신', 'start_idx': 0, 'end_idx': 2, 'type': 'PER'}\",\"{'word': '장군', 'start_idx': 9, 'end_idx': 10, 'type': 'POH'}\",per:title,wikipedia
1,1961년 비틀즈를 결성했다.,\"{'word': '비틀즈', 'start_idx': 6, 'end_idx': 8, 'type': 'ORG'}\",\"{'word': '1961년', 'start_idx': 0, 'end_idx': 4, 'type': 'DAT'}\",org:founded,wikitree
2,AB,\"{'word': 'A', 'start_idx': 0, 'end_idx': 0, 'type': 'PER'}\",\"{'word': 'B', 'start_idx': 1, 'end_idx': 1, 'type': 'LOC'}\",no_relation,policy_briefing
";

    fn write_csv(dir: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        let path = dir.path().join("train.csv");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        path
    }

    #[test]
    fn loads_rows_with_label_ids() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::load(write_csv(&dir, CSV), LabelScheme::Full).unwrap();
        assert_eq!(corpus.len(), 3);
        assert_eq!(corpus.labels(), &[4, 18, 0]);
        assert_eq!(corpus.rows()[1].subject.word, "비틀즈");
        assert_eq!(corpus.label_counts().iter().sum::<usize>(), 3);
        assert_eq!(corpus.label_histogram().get("org:founded"), Some(&1));
    }

    #[test]
    fn schemes_filter_and_project() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_csv(&dir, CSV);

        let rel = Corpus::load(&path, LabelScheme::RelationOnly).unwrap();
        assert_eq!(rel.len(), 2);
        assert_eq!(rel.labels(), &[3, 17]);

        let binary = Corpus::load(&path, LabelScheme::Binary).unwrap();
        assert_eq!(binary.labels(), &[1, 1, 0]);
    }

    #[test]
    fn model_inputs() {
        let dir = tempfile::tempdir().unwrap();
        let rows = read_rows(write_csv(&dir, CSV)).unwrap();
        assert_eq!(
            rows[0].model_input(InputFormat::Marked).unwrap(),
            ModelInput::Single("@^인물^이순신@은 조선의 #*기타*장군#이다.".to_string())
        );
        assert_eq!(
            rows[1].model_input(InputFormat::EntityPair).unwrap(),
            ModelInput::Pair("비틀즈[SEP]1961년".to_string(), "1961년 비틀즈를 결성했다.".to_string())
        );
    }

    #[test]
    fn unknown_label_names_the_row() {
        let dir = tempfile::tempdir().unwrap();
        let body = CSV.replace("org:founded,", "org:invented,");
        let path = write_csv(&dir, &body);
        for scheme in [LabelScheme::Full, LabelScheme::RelationOnly, LabelScheme::Binary] {
            let err = Corpus::load(&path, scheme).unwrap_err();
            assert!(matches!(
                err,
                DataError::Row { ref id, ref source }
                    if id == "1" && matches!(**source, DataError::UnknownLabel(_))
            ));
        }
    }

    #[test]
    fn select_concat_and_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let corpus = Corpus::load(write_csv(&dir, CSV), LabelScheme::Full).unwrap();

        let picked = corpus.select(&[2, 0]);
        assert_eq!(picked.labels(), &[0, 4]);
        let joined = picked.concat(corpus.select(&[1]));
        assert_eq!(joined.len(), 3);

        let out = dir.path().join("out.csv");
        write_rows(&out, joined.rows()).unwrap();
        assert_eq!(read_rows(&out).unwrap(), joined.rows());

        let marked = dir.path().join("marked.csv");
        write_marked(&marked, corpus.rows()).unwrap();
        let text = std::fs::read_to_string(&marked).unwrap();
        assert!(text.contains("#*날짜*1961년# @^기관^비틀즈@를 결성했다."));
    }

    #[test]
    fn rows_with_bad_spans_are_skipped_or_paired() {
        let dir = tempfile::tempdir().unwrap();
        // row 1: object overlaps subject
        let body = CSV.replace(
            "'start_idx': 0, 'end_idx': 4, 'type': 'DAT'",
            "'start_idx': 7, 'end_idx': 9, 'type': 'DAT'",
        );
        let path = write_csv(&dir, &body);

        let mut corpus = Corpus::load(&path, LabelScheme::Full).unwrap();
        assert_eq!(corpus.drop_unencodable(InputFormat::EntityPair), 0);
        assert_eq!(corpus.drop_unencodable(InputFormat::Marked), 1);
        assert_eq!(corpus.len(), 2);
        assert_eq!(corpus.labels(), &[4, 0]);
        assert_eq!(corpus.rows()[1].id, "2");

        let rows = read_rows(&path).unwrap();
        assert!(rows[1].model_input(InputFormat::Marked).is_err());
        assert_eq!(
            rows[1].model_input_or_pair(InputFormat::Marked),
            rows[1].model_input(InputFormat::EntityPair).unwrap()
        );
        assert!(matches!(
            rows[0].model_input_or_pair(InputFormat::Marked),
            ModelInput::Single(_)
        ));
    }
}
