use lapin::ConnectionProperties;

use crate::config::ConnectionConfig;

/// Properties for every lapin connection this backend opens.
pub fn connection_properties(config: &ConnectionConfig) -> ConnectionProperties {
    let properties = ConnectionProperties::default();
    match &config.connection_name {
        Some(name) => properties.with_connection_name(name.clone().into()),
        None => properties,
    }
}
