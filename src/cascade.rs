//! Dependent ("cascading") selection menus.
//!
//! A chain is an ordered list of [`CascadeLevel`]s over a flat entity list,
//! e.g. building → unit, or room → category → subcategory → type. Choosing a
//! value at one level narrows the options of the next and clears every
//! deeper choice. Each chain gets its own resolver; nothing is shared.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use serde_json::Value;

pub type Projection<E> = Arc<dyn Fn(&E) -> Option<String> + Send + Sync>;

/// One level of a chain: a key and the field it projects out of an entity.
pub struct CascadeLevel<E> {
    key: String,
    project: Projection<E>,
}

impl<E> CascadeLevel<E> {
    pub fn new(
        key: impl Into<String>,
        project: impl Fn(&E) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        Self {
            key: key.into(),
            project: Arc::new(project),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn project(&self, entity: &E) -> Option<String> {
        (self.project)(entity)
    }
}

impl<E> Clone for CascadeLevel<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key.clone(),
            project: self.project.clone(),
        }
    }
}

impl<E> fmt::Debug for CascadeLevel<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CascadeLevel").field("key", &self.key).finish_non_exhaustive()
    }
}

impl CascadeLevel<Value> {
    /// Level reading `source_field` from a JSON object. Strings, numbers and
    /// bools project to their text form; anything else is "no value".
    pub fn field(key: impl Into<String>, source_field: impl Into<String>) -> Self {
        let source_field = source_field.into();
        Self::new(key, move |entity: &Value| match entity.get(&source_field)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        })
    }
}

/// `{ key, source_field }` pair as consumers configure a chain.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LevelSpec {
    pub key: String,
    pub source_field: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CascadeError {
    /// A level holds (or would hold) a value while an earlier level is unset.
    InvalidSelection { level: usize },
    LevelOutOfRange { level: usize, depth: usize },
}

impl fmt::Display for CascadeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CascadeError::InvalidSelection { level } => {
                write!(f, "invalid cascade selection: level {level} is unset")
            }
            CascadeError::LevelOutOfRange { level, depth } => {
                write!(f, "cascade level {level} out of range (depth {depth})")
            }
        }
    }
}

impl std::error::Error for CascadeError {}

/// Chosen value per level. Immutable: every change goes through
/// [`CascadeResolver::select`] or [`CascadeResolver::clear`], which return a
/// new value.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    values: Vec<Option<String>>,
}

impl Selection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, level: usize) -> Option<&str> {
        self.values.get(level).and_then(|v| v.as_deref())
    }

    /// Number of leading levels that hold a value.
    pub fn depth(&self) -> usize {
        self.values.iter().take_while(|v| v.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.values.iter().all(|v| v.is_none())
    }

    /// Fails if any level holds a value while an earlier one is unset.
    pub fn validate(&self) -> Result<(), CascadeError> {
        let depth = self.depth();
        match self.values[depth..].iter().position(|v| v.is_some()) {
            Some(offset) => Err(CascadeError::InvalidSelection { level: depth + offset }),
            None => Ok(()),
        }
    }
}

pub struct CascadeResolver<E> {
    levels: Vec<CascadeLevel<E>>,
    entities: Vec<E>,
}

impl<E> CascadeResolver<E> {
    pub fn new(levels: Vec<CascadeLevel<E>>, entities: Vec<E>) -> Self {
        Self { levels, entities }
    }

    pub fn depth(&self) -> usize {
        self.levels.len()
    }

    pub fn level_index(&self, key: &str) -> Option<usize> {
        self.levels.iter().position(|l| l.key == key)
    }

    pub fn entities(&self) -> &[E] {
        &self.entities
    }

    fn check_level(&self, level: usize) -> Result<(), CascadeError> {
        if level >= self.levels.len() {
            return Err(CascadeError::LevelOutOfRange {
                level,
                depth: self.levels.len(),
            });
        }
        Ok(())
    }

    /// Every level before `level` must be set.
    fn check_ancestors(&self, level: usize, selection: &Selection) -> Result<(), CascadeError> {
        selection.validate()?;
        let depth = selection.depth();
        if depth < level {
            return Err(CascadeError::InvalidSelection { level: depth });
        }
        Ok(())
    }

    fn matches(&self, entity: &E, selection: &Selection, upto: usize) -> bool {
        self.levels[..upto.min(self.levels.len())]
            .iter()
            .enumerate()
            .all(|(i, level)| match selection.get(i) {
                Some(chosen) => level.project(entity).as_deref() == Some(chosen),
                None => true,
            })
    }

    /// Entities consistent with every chosen value.
    pub fn matching<'a>(&'a self, selection: &'a Selection) -> impl Iterator<Item = &'a E> + 'a {
        let upto = self.levels.len();
        self.entities
            .iter()
            .filter(move |e| self.matches(e, selection, upto))
    }

    /// Distinct values of `level` among entities matching the earlier
    /// choices, sorted lexically.
    pub fn options_for(&self, level: usize, selection: &Selection) -> Result<Vec<String>, CascadeError> {
        self.check_level(level)?;
        self.check_ancestors(level, selection)?;
        let target = &self.levels[level];
        let values: BTreeSet<String> = self
            .entities
            .iter()
            .filter(|e| self.matches(e, selection, level))
            .filter_map(|e| target.project(e))
            .filter(|v| !v.is_empty())
            .collect();
        Ok(values.into_iter().collect())
    }

    /// New selection with `level` set to `value` and every deeper level cleared.
    pub fn select(
        &self,
        level: usize,
        value: impl Into<String>,
        selection: &Selection,
    ) -> Result<Selection, CascadeError> {
        self.check_level(level)?;
        self.check_ancestors(level, selection)?;
        let mut values: Vec<Option<String>> = selection.values.iter().take(level).cloned().collect();
        values.push(Some(value.into()));
        Ok(Selection { values })
    }

    /// New selection with `level` and everything after it unset.
    pub fn clear(&self, level: usize, selection: &Selection) -> Selection {
        Selection {
            values: selection.values.iter().take(level).cloned().collect(),
        }
    }

    /// Read a derived field off the single entity the selection resolves to.
    /// `None` while the selection still matches zero or several entities.
    pub fn autofill_from<T>(&self, selection: &Selection, field: impl Fn(&E) -> T) -> Option<T> {
        if selection.validate().is_err() || selection.is_empty() {
            return None;
        }
        let mut hits = self.matching(selection);
        let only = hits.next()?;
        if hits.next().is_some() {
            return None;
        }
        Some(field(only))
    }
}

impl CascadeResolver<Value> {
    pub fn from_specs(specs: &[LevelSpec], entities: Vec<Value>) -> Self {
        let levels = specs
            .iter()
            .map(|s| CascadeLevel::field(s.key.clone(), s.source_field.clone()))
            .collect();
        Self::new(levels, entities)
    }

    /// Build from JSON text: a `[{key, source_field}]` chain and an array of
    /// entity objects.
    pub fn from_json(chain: &str, entities: &str) -> Result<Self, serde_json::Error> {
        let specs: Vec<LevelSpec> = serde_json::from_str(chain)?;
        let entities: Vec<Value> = serde_json::from_str(entities)?;
        Ok(Self::from_specs(&specs, entities))
    }
}
