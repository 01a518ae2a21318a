use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{DataError, Result};

const OBJECT_MARK: char = '#';
const OBJECT_TYPE_MARK: char = '*';
const SUBJECT_MARK: char = '@';
const SUBJECT_TYPE_MARK: char = '^';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityType {
    #[serde(rename = "PER")]
    Person,
    #[serde(rename = "ORG")]
    Organization,
    #[serde(rename = "LOC")]
    Location,
    #[serde(rename = "POH")]
    Other,
    #[serde(rename = "DAT")]
    Date,
    #[serde(rename = "NOH")]
    Quantity,
}

impl EntityType {
    pub fn from_code(code: &str) -> Result<Self> {
        match code {
            "PER" => Ok(EntityType::Person),
            "ORG" => Ok(EntityType::Organization),
            "LOC" => Ok(EntityType::Location),
            "POH" => Ok(EntityType::Other),
            "DAT" => Ok(EntityType::Date),
            "NOH" => Ok(EntityType::Quantity),
            other => Err(DataError::UnknownEntityType(other.to_string())),
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            EntityType::Person => "PER",
            EntityType::Organization => "ORG",
            EntityType::Location => "LOC",
            EntityType::Other => "POH",
            EntityType::Date => "DAT",
            EntityType::Quantity => "NOH",
        }
    }

    /// Korean gloss written inside the entity markup.
    pub fn gloss(&self) -> &'static str {
        match self {
            EntityType::Person => "인물",
            EntityType::Organization => "기관",
            EntityType::Location => "지명",
            EntityType::Other => "기타",
            EntityType::Date => "날짜",
            EntityType::Quantity => "수량",
        }
    }
}

/// An entity mention. Offsets count characters, `end_idx` is inclusive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub word: String,
    pub start_idx: usize,
    pub end_idx: usize,
    #[serde(rename = "type")]
    pub entity_type: EntityType,
}

impl Entity {
    /// Parses a dict literal such as
    /// `{'word': '비틀즈', 'start_idx': 24, 'end_idx': 26, 'type': 'ORG'}`.
    pub fn parse(literal: &str) -> Result<Self> {
        let mut fields = LiteralParser::new(literal).parse_dict()?;

        let word = match fields.remove("word") {
            Some(Value::Str(s)) => s,
            Some(Value::Int(i)) => i.to_string(),
            None => return Err(DataError::MissingEntityField("word")),
        };
        let start_idx = fields
            .remove("start_idx")
            .ok_or(DataError::MissingEntityField("start_idx"))?;
        let end_idx = fields
            .remove("end_idx")
            .ok_or(DataError::MissingEntityField("end_idx"))?;
        let entity_type = match fields.remove("type") {
            Some(Value::Str(code)) => EntityType::from_code(&code)?,
            Some(Value::Int(i)) => return Err(DataError::UnknownEntityType(i.to_string())),
            None => return Err(DataError::MissingEntityField("type")),
        };

        Ok(Self {
            word,
            start_idx: start_idx.as_offset(literal, "start_idx")?,
            end_idx: end_idx.as_offset(literal, "end_idx")?,
            entity_type,
        })
    }

    /// Inverse of [`Entity::parse`], in the dataset's single-quoted style.
    pub fn to_literal(&self) -> String {
        let word = self.word.replace('\\', "\\\\").replace('\'', "\\'");
        format!(
            "{{'word': '{}', 'start_idx': {}, 'end_idx': {}, 'type': '{}'}}",
            word,
            self.start_idx,
            self.end_idx,
            self.entity_type.code()
        )
    }

    fn span(&self) -> (usize, usize) {
        (self.start_idx, self.end_idx)
    }
}

/// Wraps the subject and object spans of `sentence` in typed markup:
/// the object becomes `#*gloss*text#`, the subject `@^gloss^text@`.
pub fn mark_entities(sentence: &str, subject: &Entity, object: &Entity) -> Result<String> {
    // Char offsets -> byte offsets; the extra entry is the end of the sentence.
    let bounds: Vec<usize> = sentence
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(sentence.len()))
        .collect();
    let n_chars = bounds.len() - 1;

    for entity in [subject, object] {
        if entity.end_idx < entity.start_idx || entity.end_idx >= n_chars {
            return Err(DataError::InvalidSpan {
                start: entity.start_idx,
                end: entity.end_idx,
                len: n_chars,
            });
        }
    }
    if subject.start_idx <= object.end_idx && object.start_idx <= subject.end_idx {
        return Err(DataError::OverlappingSpans {
            subject: subject.span(),
            object: object.span(),
        });
    }

    let object_first = object.start_idx < subject.start_idx;
    let (first, first_marks, second, second_marks) = if object_first {
        (object, (OBJECT_MARK, OBJECT_TYPE_MARK), subject, (SUBJECT_MARK, SUBJECT_TYPE_MARK))
    } else {
        (subject, (SUBJECT_MARK, SUBJECT_TYPE_MARK), object, (OBJECT_MARK, OBJECT_TYPE_MARK))
    };

    let byte = |char_idx: usize| bounds[char_idx];
    let mut out = String::with_capacity(sentence.len() + 32);
    out.push_str(&sentence[..byte(first.start_idx)]);
    let first_text = &sentence[byte(first.start_idx)..byte(first.end_idx + 1)];
    push_marked(&mut out, first_text, first, first_marks);
    out.push_str(&sentence[byte(first.end_idx + 1)..byte(second.start_idx)]);
    let second_text = &sentence[byte(second.start_idx)..byte(second.end_idx + 1)];
    push_marked(&mut out, second_text, second, second_marks);
    out.push_str(&sentence[byte(second.end_idx + 1)..]);
    Ok(out)
}

fn push_marked(out: &mut String, text: &str, entity: &Entity, (mark, type_mark): (char, char)) {
    out.push(mark);
    out.push(type_mark);
    out.push_str(entity.entity_type.gloss());
    out.push(type_mark);
    out.push_str(text);
    out.push(mark);
}

#[derive(Debug)]
enum Value {
    Str(String),
    Int(i64),
}

impl Value {
    /// `literal` is only used to locate the field in the error.
    fn as_offset(&self, literal: &str, field: &'static str) -> Result<usize> {
        let malformed = || DataError::MalformedEntity {
            offset: literal.find(field).unwrap_or(0),
            reason: format!("{} is not a non-negative integer: {:?}", field, self),
        };
        match self {
            Value::Int(i) if *i >= 0 => Ok(*i as usize),
            // Some exports quote the offsets.
            Value::Str(s) => s.trim().parse().map_err(|_| malformed()),
            Value::Int(_) => Err(malformed()),
        }
    }
}

/// Minimal reader for the flat `{key: value}` literals found in the dataset.
struct LiteralParser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> LiteralParser<'a> {
    fn new(src: &'a str) -> Self {
        Self { src, pos: 0 }
    }

    fn error(&self, reason: impl Into<String>) -> DataError {
        DataError::MalformedEntity {
            offset: self.pos,
            reason: reason.into(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.bump();
        }
    }

    fn expect(&mut self, want: char) -> Result<()> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == want => Ok(()),
            Some(c) => Err(self.error(format!("expected '{}', found '{}'", want, c))),
            None => Err(self.error(format!("expected '{}', found end of input", want))),
        }
    }

    fn parse_dict(&mut self) -> Result<HashMap<String, Value>> {
        let mut fields = HashMap::new();
        self.expect('{')?;
        self.skip_ws();
        if self.peek() == Some('}') {
            self.bump();
            return Ok(fields);
        }
        loop {
            self.skip_ws();
            let key = self.parse_string()?;
            self.expect(':')?;
            let value = self.parse_value()?;
            fields.insert(key, value);
            self.skip_ws();
            match self.bump() {
                Some(',') => {
                    self.skip_ws();
                    // Trailing comma.
                    if self.peek() == Some('}') {
                        self.bump();
                        break;
                    }
                }
                Some('}') => break,
                _ => return Err(self.error("expected ',' or '}'")),
            }
        }
        self.skip_ws();
        if self.pos != self.src.len() {
            return Err(self.error("trailing characters"));
        }
        Ok(fields)
    }

    fn parse_value(&mut self) -> Result<Value> {
        self.skip_ws();
        match self.peek() {
            Some('\'') | Some('"') => self.parse_string().map(Value::Str),
            Some(c) if c == '-' || c.is_ascii_digit() => self.parse_int().map(Value::Int),
            _ => Err(self.error("expected a string or an integer")),
        }
    }

    fn parse_int(&mut self) -> Result<i64> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while matches!(self.peek(), Some(c) if c.is_ascii_digit()) {
            self.bump();
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.error("invalid integer"))
    }

    fn parse_string(&mut self) -> Result<String> {
        let quote = match self.bump() {
            Some(q @ ('\'' | '"')) => q,
            _ => return Err(self.error("expected a quoted string")),
        };
        let mut out = String::new();
        loop {
            match self.bump() {
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some(c) => out.push(c),
                    None => return Err(self.error("unterminated escape")),
                },
                Some(c) if c == quote => return Ok(out),
                Some(c) => out.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(word: &str, start: usize, end: usize, ty: EntityType) -> Entity {
        Entity {
            word: word.to_string(),
            start_idx: start,
            end_idx: end,
            entity_type: ty,
        }
    }

    #[test]
    fn parses_dataset_literal() {
        let e = Entity::parse("{'word': '비틀즈', 'start_idx': 24, 'end_idx': 26, 'type': 'ORG'}")
            .unwrap();
        assert_eq!(e, entity("비틀즈", 24, 26, EntityType::Organization));
    }

    #[test]
    fn parses_double_quotes_and_escapes() {
        let literal = r#"{"word": "Rock 'n' Roll", 'start_idx': 0, 'end_idx': 11, 'type': 'POH'}"#;
        let e = Entity::parse(literal).unwrap();
        assert_eq!(e.word, "Rock 'n' Roll");

        let e = Entity::parse(r"{'word': 'it\'s', 'start_idx': 3, 'end_idx': 6, 'type': 'NOH'}")
            .unwrap();
        assert_eq!(e.word, "it's");
        assert_eq!(e.entity_type, EntityType::Quantity);
    }

    #[test]
    fn rejects_bad_literals() {
        assert!(matches!(
            Entity::parse("{'word': 'x', 'start_idx': 0, 'type': 'PER'}"),
            Err(DataError::MissingEntityField("end_idx"))
        ));
        assert!(matches!(
            Entity::parse("{'word': 'x', 'start_idx': 0, 'end_idx': 0, 'type': 'XYZ'}"),
            Err(DataError::UnknownEntityType(code)) if code == "XYZ"
        ));
        assert!(matches!(
            Entity::parse("{'word': 'x'"),
            Err(DataError::MalformedEntity { .. })
        ));
    }

    #[test]
    fn non_numeric_offsets_are_malformed() {
        assert_eq!(
            Entity::parse("{'word': 'x', 'start_idx': '7', 'end_idx': 7, 'type': 'PER'}")
                .unwrap()
                .start_idx,
            7
        );
        let literal = "{'word': 'x', 'start_idx': 'seven', 'end_idx': 7, 'type': 'PER'}";
        assert!(matches!(
            Entity::parse(literal),
            Err(DataError::MalformedEntity { offset, ref reason })
                if offset == literal.find("start_idx").unwrap() && reason.contains("start_idx")
        ));
        assert!(matches!(
            Entity::parse("{'word': 'x', 'start_idx': 0, 'end_idx': -1, 'type': 'PER'}"),
            Err(DataError::MalformedEntity { .. })
        ));
    }

    #[test]
    fn literal_survives_quotes() {
        let e = entity("it's", 0, 3, EntityType::Person);
        assert_eq!(
            e.to_literal(),
            r"{'word': 'it\'s', 'start_idx': 0, 'end_idx': 3, 'type': 'PER'}"
        );
        assert_eq!(Entity::parse(&e.to_literal()).unwrap(), e);
    }

    #[test]
    fn subject_before_object() {
        let sentence = "이순신은 조선의 장군이다.";
        let subject = entity("이순신", 0, 2, EntityType::Person);
        let object = entity("장군", 9, 10, EntityType::Other);
        let marked = mark_entities(sentence, &subject, &object).unwrap();
        assert_eq!(marked, "@^인물^이순신@은 조선의 #*기타*장군#이다.");
    }

    #[test]
    fn object_before_subject() {
        let sentence = "1961년 비틀즈를 결성했다.";
        let subject = entity("비틀즈", 6, 8, EntityType::Organization);
        let object = entity("1961년", 0, 4, EntityType::Date);
        let marked = mark_entities(sentence, &subject, &object).unwrap();
        assert_eq!(marked, "#*날짜*1961년# @^기관^비틀즈@를 결성했다.");
    }

    #[test]
    fn adjacent_spans_and_sentence_edges() {
        let sentence = "AB";
        let subject = entity("A", 0, 0, EntityType::Person);
        let object = entity("B", 1, 1, EntityType::Location);
        assert_eq!(
            mark_entities(sentence, &subject, &object).unwrap(),
            "@^인물^A@#*지명*B#"
        );
    }

    #[test]
    fn invalid_spans_are_errors() {
        let sentence = "짧은 문장";
        let inside = entity("짧은", 0, 1, EntityType::Other);
        let past_end = entity("?", 3, 5, EntityType::Other);
        assert!(matches!(
            mark_entities(sentence, &inside, &past_end),
            Err(DataError::InvalidSpan { len: 5, .. })
        ));

        let overlapping = entity("은 문", 1, 3, EntityType::Other);
        assert!(matches!(
            mark_entities(sentence, &inside, &overlapping),
            Err(DataError::OverlappingSpans { .. })
        ));

        let reversed = entity("?", 3, 2, EntityType::Other);
        assert!(mark_entities(sentence, &inside, &reversed).is_err());
    }
}
