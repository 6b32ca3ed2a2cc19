mod json_ext;
mod object_id;

pub use self::json_ext::ResourceJson;
pub use self::object_id::{ObjectId, ObjectIdRef};

use serde_json::Value;

use std::fmt::{self, Display};

pub type JsonObject = serde_json::Map<String, Value>;

/// The `apiVersion` that's assumed for documents that don't specify one
pub const DEFAULT_API_VERSION: &str = "v1";
/// The namespace that's assumed for namespaced documents that don't specify one
pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, PartialEq, Clone)]
pub struct InvalidResourceError {
    pub message: &'static str,
    pub value: Value,
}

impl InvalidResourceError {
    pub fn new(message: &'static str, value: Value) -> Self {
        InvalidResourceError { message, value }
    }
}

impl Display for InvalidResourceError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Invalid Resource: {}, value: {}", self.message, self.value)
    }
}

impl std::error::Error for InvalidResourceError {}

/// Error returned when the contents of a spec file cannot be turned into a `ResourceDocument`
#[derive(Debug)]
pub enum SpecParseError {
    Json(serde_json::Error),
    Yaml(serde_yaml::Error),
    Invalid(InvalidResourceError),
}

impl Display for SpecParseError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SpecParseError::Json(e) => write!(f, "invalid json: {}", e),
            SpecParseError::Yaml(e) => write!(f, "invalid yaml: {}", e),
            SpecParseError::Invalid(e) => Display::fmt(e, f),
        }
    }
}

impl std::error::Error for SpecParseError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SpecParseError::Json(e) => Some(e),
            SpecParseError::Yaml(e) => Some(e),
            SpecParseError::Invalid(e) => Some(e),
        }
    }
}

impl From<InvalidResourceError> for SpecParseError {
    fn from(e: InvalidResourceError) -> SpecParseError {
        SpecParseError::Invalid(e)
    }
}

/// A single Kubernetes object as it appears in a spec file. This is deliberately weakly typed: the
/// only things we ever look at are `kind`, `apiVersion` and `metadata`, and everything else is
/// passed through to the api server untouched. The only structural requirement is that the document
/// is a json object. Missing `kind` and `name` are reported by the client when the document is
/// actually used to address something.
#[derive(Debug, PartialEq, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceDocument(Value);

impl ResourceDocument {
    pub fn from_value(value: Value) -> Result<ResourceDocument, InvalidResourceError> {
        if value.is_object() {
            Ok(ResourceDocument(value))
        } else {
            Err(InvalidResourceError::new("document must be an object", value))
        }
    }

    /// Parses the contents of a spec file. Files ending in `.json` are parsed as json and
    /// everything else as yaml. Each file must contain exactly one resource.
    pub fn parse(path: &str, content: &str) -> Result<ResourceDocument, SpecParseError> {
        let value: Value = if path.ends_with(".json") {
            serde_json::from_str(content).map_err(SpecParseError::Json)?
        } else {
            serde_yaml::from_str(content).map_err(SpecParseError::Yaml)?
        };
        ResourceDocument::from_value(value).map_err(Into::into)
    }

    pub fn into_value(self) -> Value {
        self.0
    }

    pub fn kind(&self) -> Option<&str> {
        self.0.get_kind()
    }

    /// Returns the `apiVersion`, or `v1` if the document doesn't have one
    pub fn api_version(&self) -> &str {
        self.0.get_api_version().unwrap_or(DEFAULT_API_VERSION)
    }

    pub fn name(&self) -> Option<&str> {
        self.0.get_name()
    }

    /// Returns the namespace. An empty namespace is treated the same as a missing one.
    pub fn namespace(&self) -> Option<&str> {
        self.0.get_namespace().filter(|ns| !ns.is_empty())
    }

    pub fn annotations(&self) -> Option<&JsonObject> {
        self.0.get_annotations()
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.0.get_annotation(key)
    }

    /// Documents without a namespace are identified as being in the `default` namespace, since
    /// that's where the client will put them.
    pub fn identity(&self) -> ResourceIdentity {
        ResourceIdentity {
            kind: self.kind().unwrap_or("").to_owned(),
            id: ObjectIdRef::new(
                self.namespace().unwrap_or(DEFAULT_NAMESPACE),
                self.name().unwrap_or(""),
            )
            .to_owned(),
        }
    }

    pub(crate) fn set_api_version(&mut self, api_version: &str) {
        self.object_mut()
            .insert("apiVersion".to_owned(), Value::String(api_version.to_owned()));
    }

    pub(crate) fn set_namespace(&mut self, namespace: &str) {
        self.metadata_mut()
            .insert("namespace".to_owned(), Value::String(namespace.to_owned()));
    }

    /// returns the metadata object, inserting an empty one if it's missing or isn't an object
    pub(crate) fn metadata_mut(&mut self) -> &mut JsonObject {
        let obj = self.object_mut();
        let metadata = obj
            .entry("metadata")
            .or_insert_with(|| Value::Object(JsonObject::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(JsonObject::new());
        }
        match metadata {
            Value::Object(map) => map,
            _ => unreachable!("metadata was just set to an object"),
        }
    }

    fn object_mut(&mut self) -> &mut JsonObject {
        match self.0 {
            Value::Object(ref mut map) => map,
            // the constructors guarantee that the value is an object
            _ => unreachable!("ResourceDocument must always be an object"),
        }
    }
}

impl AsRef<Value> for ResourceDocument {
    fn as_ref(&self) -> &Value {
        &self.0
    }
}

impl std::convert::TryFrom<Value> for ResourceDocument {
    type Error = InvalidResourceError;

    fn try_from(value: Value) -> Result<ResourceDocument, InvalidResourceError> {
        ResourceDocument::from_value(value)
    }
}

impl From<ResourceDocument> for Value {
    fn from(doc: ResourceDocument) -> Value {
        doc.into_value()
    }
}

impl Display for ResourceDocument {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The key that's used to decide whether two documents represent "the same object". Only the `kind`,
/// `namespace` and `name` are considered. Any other differences, including annotations, are irrelevant.
#[derive(Debug, PartialEq, Eq, Hash, Clone, PartialOrd, Ord)]
pub struct ResourceIdentity {
    pub kind: String,
    pub id: ObjectId,
}

impl ResourceIdentity {
    pub fn new(kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        ResourceIdentity {
            kind: kind.into(),
            id: ObjectId::new(namespace, name),
        }
    }
}

impl Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.id)
    }
}
