//! Typed key/value entries a plugin stores in projects.

use serde::{Deserialize, Serialize};

pub const CUSTOM_DATA_TYPE_BOOLEAN: &str = "http://kxstudio.sf.net/ns/carla/boolean";
pub const CUSTOM_DATA_TYPE_CHUNK: &str = "http://kxstudio.sf.net/ns/carla/chunk";
pub const CUSTOM_DATA_TYPE_PROPERTY: &str = "http://kxstudio.sf.net/ns/carla/property";
pub const CUSTOM_DATA_TYPE_STRING: &str = "http://kxstudio.sf.net/ns/carla/string";

/// Keys the host itself stores as `property` entries.
pub const CUSTOM_DATA_KEY_UI_POSITION: &str = "CarlaUiPosition";
pub const CUSTOM_DATA_KEY_UI_SIZE: &str = "CarlaUiSize";
pub const CUSTOM_DATA_KEY_UI_VISIBLE: &str = "CarlaUiVisible";
/// Toggled around save/load for bridged plugins so the bridge keeps answering pings.
pub const CUSTOM_DATA_KEY_PING: &str = "__CarlaPingOnOff__";

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CustomData {
    pub data_type: String,
    pub key: String,
    pub value: String,
}

impl CustomData {
    pub fn new(
        data_type: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            data_type: data_type.into(),
            key: key.into(),
            value: value.into(),
        }
    }

    /// Type and key must be set; the value may be empty.
    pub fn is_valid(&self) -> bool {
        !self.data_type.is_empty() && !self.key.is_empty()
    }

    pub fn is_chunk(&self) -> bool {
        self.data_type == CUSTOM_DATA_TYPE_CHUNK
    }
}

/// Insert or replace by `(type, key)`.
pub fn upsert(list: &mut Vec<CustomData>, data: CustomData) {
    match list
        .iter_mut()
        .find(|d| d.data_type == data.data_type && d.key == data.key)
    {
        Some(existing) => existing.value = data.value,
        None => list.push(data),
    }
}
