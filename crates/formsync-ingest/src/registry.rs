//! Schema registry
//!
//! Holds one [`FormDefinition`] per configured form. Definitions come from a
//! YAML forms file and are validated as a whole when the registry is built:
//! a single bad form rejects the entire file so that no form is ever half
//! imported.
//!
//! ```yaml
//! forms:
//!   - id: baseline_v1
//!     name: baseline
//!     unique_key: KEY
//!     fields:
//!       - source_name: q1
//!         target_name: answer1
//!         type: string
//!       - source_name: household_members
//!         type: repeat
//!         children:
//!           - { source_name: name, type: string }
//!           - { source_name: age, type: int, default: -1 }
//! ```

use formsync_common::{DataType, FieldValue, ScalarType};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{ConfigError, IngestError};
use crate::flatten::discover_repeat_groups;

/// Column holding a repeat-group record's own key
pub const CHILD_KEY_COLUMN: &str = "key";

/// Column holding the key of the record a repeat-group entry belongs to
pub const PARENT_KEY_COLUMN: &str = "parent_key";

/// Deepest nesting of repeat groups accepted from configuration
pub const MAX_FIELD_DEPTH: usize = 16;

/// One field of a form, possibly a repeat group owning child fields
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub source_name: String,
    pub target_name: String,
    pub kind: FieldKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Scalar {
        data_type: ScalarType,
        default_value: FieldValue,
    },
    Repeat {
        children: Vec<FieldSpec>,
    },
}

impl FieldSpec {
    /// Scalar field stored under its source name with the type's default
    pub fn scalar(source_name: impl Into<String>, data_type: ScalarType) -> Self {
        let source_name = source_name.into();
        Self {
            target_name: source_name.clone(),
            source_name,
            kind: FieldKind::Scalar {
                data_type,
                default_value: data_type.default_value(),
            },
        }
    }

    pub fn repeat(source_name: impl Into<String>, children: Vec<FieldSpec>) -> Self {
        let source_name = source_name.into();
        Self {
            target_name: source_name.clone(),
            source_name,
            kind: FieldKind::Repeat { children },
        }
    }

    pub fn with_target(mut self, target_name: impl Into<String>) -> Self {
        self.target_name = target_name.into();
        self
    }

    /// Override the default of a scalar field; repeat fields are unchanged
    pub fn with_default(mut self, value: FieldValue) -> Self {
        if let FieldKind::Scalar { default_value, .. } = &mut self.kind {
            *default_value = value;
        }
        self
    }

    pub fn data_type(&self) -> DataType {
        match &self.kind {
            FieldKind::Scalar { data_type, .. } => match data_type {
                ScalarType::String => DataType::String,
                ScalarType::Int => DataType::Int,
                ScalarType::Float => DataType::Float,
                ScalarType::Bool => DataType::Bool,
                ScalarType::Date => DataType::Date,
            },
            FieldKind::Repeat { .. } => DataType::Repeat,
        }
    }

    pub fn is_repeat(&self) -> bool {
        matches!(self.kind, FieldKind::Repeat { .. })
    }

    /// Child fields of a repeat group (empty for scalars)
    pub fn children(&self) -> &[FieldSpec] {
        match &self.kind {
            FieldKind::Repeat { children } => children,
            FieldKind::Scalar { .. } => &[],
        }
    }
}

/// A configured form
#[derive(Debug, Clone, PartialEq)]
pub struct FormDefinition {
    pub id: String,
    pub name: String,
    /// Target column identifying a submission
    pub unique_key: String,
    pub fields: Vec<FieldSpec>,
    /// Explicit table/collection name; defaults to `name`
    pub target: Option<String>,
    /// Also ingest repeat groups the source reports but the form does not declare
    pub discover_repeat_groups: bool,
}

impl FormDefinition {
    pub fn new(id: impl Into<String>, unique_key: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            unique_key: unique_key.into(),
            fields,
            target: None,
            discover_repeat_groups: false,
        }
    }

    /// Table or collection the form's submissions are written to
    pub fn target_name(&self) -> &str {
        self.target.as_deref().unwrap_or(&self.name)
    }

    /// Table or collection for one repeat group of this form
    pub fn group_target_name(&self, group_path: &[String]) -> String {
        let mut name = self.target_name().to_string();
        for segment in group_path {
            name.push_str("__");
            name.push_str(segment);
        }
        name
    }

    /// Every table or collection the form writes to: its own, then one per
    /// declared repeat group
    pub fn targets(&self) -> Vec<String> {
        std::iter::once(self.target_name().to_string())
            .chain(
                discover_repeat_groups(&self.fields)
                    .iter()
                    .map(|g| self.group_target_name(&g.target_path)),
            )
            .collect()
    }

    /// Field whose target name is the unique key, if one is declared
    pub fn key_field(&self) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|f| !f.is_repeat() && f.target_name == self.unique_key)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::form("<unnamed>", "form id cannot be empty"));
        }
        if self.unique_key.trim().is_empty() {
            return Err(ConfigError::form(&self.id, "unique_key is required"));
        }
        if self.target_name().trim().is_empty() {
            return Err(ConfigError::form(&self.id, "target name cannot be empty"));
        }

        if let Some(field) = self.fields.iter().find(|f| f.target_name == self.unique_key) {
            if field.is_repeat() {
                return Err(ConfigError::form(
                    &self.id,
                    format!("unique_key '{}' cannot be a repeat group", self.unique_key),
                ));
            }
        }

        validate_level(&self.id, &self.fields, &[], 1)
    }
}

fn validate_level(
    form_id: &str,
    fields: &[FieldSpec],
    reserved: &[&str],
    depth: usize,
) -> Result<(), ConfigError> {
    if depth > MAX_FIELD_DEPTH {
        return Err(ConfigError::form(
            form_id,
            format!("repeat groups nested deeper than {}", MAX_FIELD_DEPTH),
        ));
    }

    let mut seen = HashSet::new();
    for field in fields {
        if field.source_name.trim().is_empty() || field.target_name.trim().is_empty() {
            return Err(ConfigError::form(form_id, "field names cannot be empty"));
        }
        if reserved.contains(&field.target_name.as_str()) {
            return Err(ConfigError::form(
                form_id,
                format!("field name '{}' is reserved in repeat groups", field.target_name),
            ));
        }
        if !seen.insert(field.target_name.as_str()) {
            return Err(ConfigError::form(
                form_id,
                format!("duplicate target field name '{}'", field.target_name),
            ));
        }

        if let FieldKind::Repeat { children } = &field.kind {
            if children.is_empty() {
                return Err(ConfigError::form(
                    form_id,
                    format!("repeat group '{}' declares no fields", field.source_name),
                ));
            }
            validate_level(
                form_id,
                children,
                &[CHILD_KEY_COLUMN, PARENT_KEY_COLUMN],
                depth + 1,
            )?;
        }
    }

    Ok(())
}

fn scalar_target_names(fields: &[FieldSpec]) -> Vec<&String> {
    let mut names = Vec::new();
    for field in fields {
        match &field.kind {
            FieldKind::Scalar { .. } => names.push(&field.target_name),
            FieldKind::Repeat { children } => names.extend(scalar_target_names(children)),
        }
    }
    names
}

// ============================================================================
// Forms file
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct FormsFile {
    #[serde(default)]
    pub forms: Vec<FormConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FormConfig {
    #[serde(alias = "form_id")]
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(alias = "unique_column")]
    pub unique_key: String,
    #[serde(default)]
    pub target: Option<String>,
    #[serde(default)]
    pub discover_repeat_groups: bool,
    #[serde(default)]
    pub fields: Vec<FieldConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldConfig {
    #[serde(alias = "name")]
    pub source_name: String,
    #[serde(default, alias = "db_name")]
    pub target_name: Option<String>,
    #[serde(default = "default_field_type", rename = "type")]
    pub data_type: String,
    #[serde(default, rename = "default")]
    pub default_value: Option<serde_json::Value>,
    #[serde(default)]
    pub children: Vec<FieldConfig>,
}

fn default_field_type() -> String {
    "string".to_string()
}

impl FieldConfig {
    fn into_spec(self, form_id: &str) -> Result<FieldSpec, ConfigError> {
        let data_type: DataType = self
            .data_type
            .parse()
            .map_err(|e: formsync_common::CommonError| ConfigError::form(form_id, e.to_string()))?;

        let target_name = self.target_name.unwrap_or_else(|| self.source_name.clone());

        let kind = match data_type.scalar() {
            Some(scalar) => {
                if !self.children.is_empty() {
                    return Err(ConfigError::form(
                        form_id,
                        format!("field '{}' has children but is not a repeat", self.source_name),
                    ));
                }
                let default_value = match &self.default_value {
                    None => scalar.default_value(),
                    Some(raw) => scalar
                        .coerce(raw)
                        .map_err(|e| {
                            ConfigError::form(
                                form_id,
                                format!("default for '{}': {}", self.source_name, e),
                            )
                        })?
                        .unwrap_or_else(|| scalar.default_value()),
                };
                FieldKind::Scalar {
                    data_type: scalar,
                    default_value,
                }
            },
            None => FieldKind::Repeat {
                children: self
                    .children
                    .into_iter()
                    .map(|child| child.into_spec(form_id))
                    .collect::<Result<_, _>>()?,
            },
        };

        Ok(FieldSpec {
            source_name: self.source_name,
            target_name,
            kind,
        })
    }
}

impl TryFrom<FormConfig> for FormDefinition {
    type Error = ConfigError;

    fn try_from(config: FormConfig) -> Result<Self, Self::Error> {
        let id = config.id;
        let fields = config
            .fields
            .into_iter()
            .map(|f| f.into_spec(&id))
            .collect::<Result<Vec<_>, _>>()?;

        let form = FormDefinition {
            name: config.name.unwrap_or_else(|| id.clone()),
            id,
            unique_key: config.unique_key,
            fields,
            target: config.target,
            discover_repeat_groups: config.discover_repeat_groups,
        };
        form.validate()?;
        Ok(form)
    }
}

// ============================================================================
// Registry
// ============================================================================

/// Immutable lookup of form definitions for one run
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    forms: Vec<FormDefinition>,
    index: HashMap<String, usize>,
    /// Declared table or collection name to the id of the form writing it
    targets: HashMap<String, String>,
}

impl SchemaRegistry {
    /// Build a registry, rejecting the whole set if any form is invalid
    pub fn new(forms: Vec<FormDefinition>) -> Result<Self, ConfigError> {
        let mut index = HashMap::with_capacity(forms.len());
        let mut targets = HashMap::with_capacity(forms.len());

        for (position, form) in forms.iter().enumerate() {
            form.validate()?;
            if index.insert(form.id.clone(), position).is_some() {
                return Err(ConfigError::form(&form.id, "form id is declared twice"));
            }
            for target in form.targets() {
                if targets.insert(target.clone(), form.id.clone()).is_some() {
                    return Err(ConfigError::form(
                        &form.id,
                        format!("target '{}' is shared with another form or repeat group", target),
                    ));
                }
            }
        }

        Ok(Self { forms, index, targets })
    }

    /// Reject declared table and column names longer than `max_bytes`
    pub fn check_identifier_lengths(&self, max_bytes: usize) -> Result<(), ConfigError> {
        for form in &self.forms {
            let columns = std::iter::once(&form.unique_key).chain(scalar_target_names(&form.fields));
            for name in form.targets().iter().chain(columns) {
                if name.len() > max_bytes {
                    return Err(ConfigError::form(
                        &form.id,
                        format!("name '{}' is longer than {} bytes", name, max_bytes),
                    ));
                }
            }
        }
        Ok(())
    }

    pub fn from_configs(configs: Vec<FormConfig>) -> Result<Self, ConfigError> {
        let forms = configs
            .into_iter()
            .map(FormDefinition::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(forms)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let file: FormsFile = serde_yaml::from_str(yaml)?;
        Self::from_configs(file.forms)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn get(&self, form_id: &str) -> Result<&FormDefinition, IngestError> {
        self.index
            .get(form_id)
            .map(|&i| &self.forms[i])
            .ok_or_else(|| IngestError::FormNotFound(form_id.to_string()))
    }

    /// Forms in declaration order
    pub fn forms(&self) -> impl Iterator<Item = &FormDefinition> {
        self.forms.iter()
    }

    /// Every declared form and repeat-group target, mapped to its form's id
    pub fn targets(&self) -> &HashMap<String, String> {
        &self.targets
    }

    pub fn len(&self) -> usize {
        self.forms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.forms.is_empty()
    }
}
