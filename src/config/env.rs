use super::FieldConfig;

/// Path of the TOML configuration file
pub const ENV_CONFIG: &str = "FIELDLINK_CONFIG";
pub const ENV_API_URL: &str = "FIELDLINK_API_URL";
pub const ENV_PUSH_URL: &str = "FIELDLINK_PUSH_URL";
pub const ENV_QUEUE_DB: &str = "FIELDLINK_QUEUE_DB";
pub const ENV_TOKEN: &str = "FIELDLINK_TOKEN";

/// Override endpoint, database and token settings from the environment.
///
/// `lookup` is `std::env::var(..).ok()` in the binary; empty values are ignored.
pub fn apply_env_overrides<F>(config: &mut FieldConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

    if let Some(v) = get(ENV_API_URL) {
        config.service.api_url = v;
    }
    if let Some(v) = get(ENV_PUSH_URL) {
        config.service.push_url = v;
    }
    if let Some(v) = get(ENV_QUEUE_DB) {
        config.queue.db_path = v;
    }
    if let Some(v) = get(ENV_TOKEN) {
        config.service.access_token = Some(v);
    }
}
