use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::field_value::FieldValue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldDataType {
    String,
    TextArea,
    Boolean,
    Int,
    Double,
    Currency,
    Percent,
    Date,
    DateTime,
    Picklist,
    Reference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReferenceInfo {
    /// Name of the relationship field that carries the link, e.g. `Owner` for `OwnerId`.
    pub relationship_name: String,
    pub reference_to: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldInfo {
    pub api_name: String,
    pub data_type: FieldDataType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reference: Option<ReferenceInfo>,
}

impl FieldInfo {
    pub fn new(api_name: impl Into<String>, data_type: FieldDataType) -> Self {
        Self {
            api_name: api_name.into(),
            data_type,
            reference: None,
        }
    }

    pub fn reference(
        api_name: impl Into<String>,
        relationship_name: impl Into<String>,
        reference_to: &[&str],
    ) -> Self {
        Self {
            api_name: api_name.into(),
            data_type: FieldDataType::Reference,
            reference: Some(ReferenceInfo {
                relationship_name: relationship_name.into(),
                reference_to: reference_to.iter().map(|s| s.to_string()).collect(),
            }),
        }
    }

    /// Display value the server would have computed for `value`. Text-like and
    /// reference fields carry no display value.
    pub fn display_value(&self, value: &FieldValue) -> Option<String> {
        match (self.data_type, value) {
            (_, FieldValue::Null) => None,
            (FieldDataType::Int, FieldValue::Integer(n)) => Some(n.to_string()),
            (
                FieldDataType::Double | FieldDataType::Currency | FieldDataType::Percent,
                FieldValue::Integer(n),
            ) => Some(n.to_string()),
            (
                FieldDataType::Double | FieldDataType::Currency | FieldDataType::Percent,
                FieldValue::Float(n),
            ) => Some(n.to_string()),
            (FieldDataType::Date | FieldDataType::DateTime, FieldValue::Text(s)) => {
                Some(s.clone())
            }
            (FieldDataType::Picklist, FieldValue::Text(s)) => Some(s.clone()),
            _ => None,
        }
    }
}

/// Field and relationship metadata for one object type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectInfo {
    pub api_name: String,
    pub key_prefix: String,
    pub fields: BTreeMap<String, FieldInfo>,
}

impl ObjectInfo {
    pub fn new(api_name: impl Into<String>, key_prefix: impl Into<String>) -> Self {
        Self {
            api_name: api_name.into(),
            key_prefix: key_prefix.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field: FieldInfo) -> Self {
        self.fields.insert(field.api_name.clone(), field);
        self
    }

    pub fn field(&self, name: &str) -> Option<&FieldInfo> {
        self.fields.get(name)
    }

    pub fn reference_info(&self, name: &str) -> Option<&ReferenceInfo> {
        self.fields.get(name).and_then(|f| f.reference.as_ref())
    }
}
