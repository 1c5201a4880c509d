//! Type descriptors returned by `dump_type`

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDump {
    pub name: String,
    pub type_name: String,
    #[serde(default)]
    pub is_static: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterDump {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MethodDump {
    pub name: String,
    pub return_type: String,
    #[serde(default)]
    pub parameters: Vec<ParameterDump>,
    #[serde(default)]
    pub generic_args: Vec<String>,
    #[serde(default)]
    pub is_static: bool,
}

impl MethodDump {
    pub fn parameter_types(&self) -> Vec<String> {
        self.parameters.iter().map(|p| p.type_name.clone()).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventDump {
    pub name: String,
    #[serde(default)]
    pub argument_types: Vec<String>,
}

/// Descriptor of a loaded type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDump {
    pub assembly: String,
    pub full_type_name: String,
    #[serde(default)]
    pub base_type: Option<String>,
    #[serde(default)]
    pub fields: Vec<FieldDump>,
    #[serde(default)]
    pub properties: Vec<FieldDump>,
    #[serde(default)]
    pub methods: Vec<MethodDump>,
    #[serde(default)]
    pub constructors: Vec<MethodDump>,
    #[serde(default)]
    pub events: Vec<EventDump>,
    /// Element type for collection types
    #[serde(default)]
    pub element_type: Option<String>,
}

impl TypeDump {
    pub fn method(&self, name: &str) -> impl Iterator<Item = &MethodDump> {
        let name = name.to_string();
        self.methods.iter().filter(move |m| m.name == name)
    }

    pub fn has_member(&self, name: &str) -> bool {
        self.fields.iter().any(|f| f.name == name)
            || self.properties.iter().any(|p| p.name == name)
            || self.methods.iter().any(|m| m.name == name)
            || self.events.iter().any(|e| e.name == name)
    }
}
