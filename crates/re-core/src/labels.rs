use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use crate::error::{DataError, Result};

pub const NO_RELATION: &str = "no_relation";
pub const RELATION: &str = "relation";

/// KLUE-RE relation names in class-id order.
pub const KLUE_LABELS: [&str; 30] = [
    NO_RELATION,
    "org:top_members/employees",
    "org:members",
    "org:product",
    "per:title",
    "org:alternate_names",
    "per:employee_of",
    "org:place_of_headquarters",
    "per:product",
    "org:number_of_employees/members",
    "per:children",
    "per:place_of_residence",
    "per:alternate_names",
    "per:other_family",
    "per:colleagues",
    "per:origin",
    "per:siblings",
    "per:spouse",
    "org:founded",
    "org:political/religious_affiliation",
    "org:member_of",
    "per:parents",
    "org:dissolved",
    "per:schools_attended",
    "per:date_of_death",
    "per:date_of_birth",
    "per:place_of_birth",
    "per:place_of_death",
    "org:founded_by",
    "per:religion",
];

/// Bijective mapping between relation names and dense class ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelDict {
    name_to_id: HashMap<String, usize>,
    id_to_name: Vec<String>,
}

impl LabelDict {
    pub fn from_names<I, S>(names: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut name_to_id = HashMap::new();
        let mut id_to_name = Vec::new();
        for name in names {
            let name = name.into();
            if name_to_id.contains_key(&name) {
                return Err(DataError::DuplicateLabel(name));
            }
            name_to_id.insert(name.clone(), id_to_name.len());
            id_to_name.push(name);
        }
        Ok(Self {
            name_to_id,
            id_to_name,
        })
    }

    pub fn klue() -> Self {
        Self::from_names(KLUE_LABELS).expect("KLUE label table has no duplicates")
    }

    pub fn id(&self, name: &str) -> Result<usize> {
        self.name_to_id
            .get(name)
            .copied()
            .ok_or_else(|| DataError::UnknownLabel(name.to_string()))
    }

    pub fn name(&self, id: usize) -> Result<&str> {
        self.id_to_name
            .get(id)
            .map(String::as_str)
            .ok_or(DataError::UnknownLabelId(id))
    }

    pub fn encode_all<S: AsRef<str>>(&self, names: &[S]) -> Result<Vec<usize>> {
        names.iter().map(|n| self.id(n.as_ref())).collect()
    }

    pub fn names(&self) -> &[String] {
        &self.id_to_name
    }

    pub fn len(&self) -> usize {
        self.id_to_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_name.is_empty()
    }

    /// Writes the dictionary as a `{name: id}` JSON object.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &self.name_to_id)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        let name_to_id: HashMap<String, usize> = serde_json::from_reader(reader)?;

        let len = name_to_id.len();
        let mut slots: Vec<Option<String>> = vec![None; len];
        for (name, &id) in &name_to_id {
            let slot = slots.get_mut(id).ok_or(DataError::UnknownLabelId(id))?;
            if slot.is_some() {
                return Err(DataError::DuplicateLabel(name.clone()));
            }
            *slot = Some(name.clone());
        }

        let mut id_to_name = Vec::with_capacity(len);
        for (id, slot) in slots.into_iter().enumerate() {
            match slot {
                Some(name) => id_to_name.push(name),
                None => return Err(DataError::SparseLabelIds { len, missing: id }),
            }
        }

        Ok(Self {
            name_to_id,
            id_to_name,
        })
    }
}

/// Which label space a model is trained on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelScheme {
    /// All 30 KLUE classes.
    #[default]
    Full,
    /// The 29 relations, `no_relation` rows dropped.
    RelationOnly,
    /// `no_relation` against any relation.
    Binary,
}

impl LabelScheme {
    pub fn dict(&self) -> LabelDict {
        match self {
            LabelScheme::Full => LabelDict::klue(),
            LabelScheme::RelationOnly => LabelDict::from_names(KLUE_LABELS[1..].iter().copied())
                .expect("KLUE label table has no duplicates"),
            LabelScheme::Binary => LabelDict::from_names([NO_RELATION, RELATION])
                .expect("binary labels are distinct"),
        }
    }

    pub fn num_labels(&self) -> usize {
        match self {
            LabelScheme::Full => KLUE_LABELS.len(),
            LabelScheme::RelationOnly => KLUE_LABELS.len() - 1,
            LabelScheme::Binary => 2,
        }
    }

    pub fn accepts(&self, label: &str) -> bool {
        !(matches!(self, LabelScheme::RelationOnly) && label == NO_RELATION)
    }

    /// Maps a raw KLUE label into this scheme's label space. Labels outside
    /// the KLUE set are rejected under every scheme.
    pub fn project<'a>(&self, label: &'a str) -> Result<&'a str> {
        if !KLUE_LABELS.contains(&label) {
            return Err(DataError::UnknownLabel(label.to_string()));
        }
        Ok(match self {
            LabelScheme::Binary if label != NO_RELATION => RELATION,
            _ => label,
        })
    }

    /// Class id of `no_relation` in this scheme, if it has one.
    pub fn no_relation_id(&self) -> Option<usize> {
        match self {
            LabelScheme::RelationOnly => None,
            LabelScheme::Full | LabelScheme::Binary => Some(0),
        }
    }
}

impl std::str::FromStr for LabelScheme {
    type Err = DataError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "full" => Ok(LabelScheme::Full),
            "relation_only" | "rel" => Ok(LabelScheme::RelationOnly),
            "binary" | "no_rel" => Ok(LabelScheme::Binary),
            other => Err(DataError::UnknownScheme(other.to_string())),
        }
    }
}
