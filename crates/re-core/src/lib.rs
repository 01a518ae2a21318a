pub mod dataset;
pub mod entity;
pub mod error;
pub mod labels;
pub mod split;

pub use dataset::{read_rows, Corpus, InputFormat, ModelInput, RelationRow};
pub use entity::{mark_entities, Entity, EntityType};
pub use error::DataError;
pub use labels::{LabelDict, LabelScheme};
pub use split::{Fold, SplitMode};
