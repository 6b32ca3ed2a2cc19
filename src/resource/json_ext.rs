use crate::resource::JsonObject;
use serde_json::Value;

pub static API_VERSION_POINTER: &str = "/apiVersion";
pub static KIND_POINTER: &str = "/kind";
pub static NAMESPACE_POINTER: &str = "/metadata/namespace";
pub static NAME_POINTER: &str = "/metadata/name";
pub static ANNOTATIONS_POINTER: &str = "/metadata/annotations";

/// Accessors for the fields every Kubernetes resource has, implemented directly on json values
/// so they can be used on documents that haven't been validated yet. Fields that are present
/// but have the wrong type are treated the same as missing ones.
pub trait ResourceJson {
    fn get_api_version(&self) -> Option<&str>;
    fn get_kind(&self) -> Option<&str>;
    fn get_namespace(&self) -> Option<&str>;
    fn get_name(&self) -> Option<&str>;
    fn get_annotations(&self) -> Option<&JsonObject>;

    fn get_annotation(&self, key: &str) -> Option<&str> {
        self.get_annotations()?.get(key).and_then(Value::as_str)
    }
}

fn str_value<'a, 'b>(value: &'a Value, pointer: &'b str) -> Option<&'a str> {
    value.pointer(pointer).and_then(Value::as_str)
}

impl ResourceJson for Value {
    fn get_api_version(&self) -> Option<&str> {
        str_value(self, API_VERSION_POINTER)
    }

    fn get_kind(&self) -> Option<&str> {
        str_value(self, KIND_POINTER)
    }

    fn get_namespace(&self) -> Option<&str> {
        str_value(self, NAMESPACE_POINTER)
    }

    fn get_name(&self) -> Option<&str> {
        str_value(self, NAME_POINTER)
    }

    fn get_annotations(&self) -> Option<&JsonObject> {
        self.pointer(ANNOTATIONS_POINTER).and_then(Value::as_object)
    }
}
