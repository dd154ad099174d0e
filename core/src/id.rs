use chrono::Utc;
use uuid::Uuid;

/// Id prefixes for every persisted entity kind.
pub const INITIATIVE: &str = "INIT";
pub const PRD: &str = "PRD";
pub const TASK: &str = "TASK";
pub const WORK_PRODUCT: &str = "WP";
pub const CHECKPOINT: &str = "CP";
pub const ITERATION: &str = "IT";
pub const HANDOFF: &str = "HO";
pub const SCOPE_CHANGE: &str = "SCR";
pub const VIOLATION: &str = "VIOL";
pub const PERFORMANCE: &str = "PERF";

/// Generate an opaque id of the form `PREFIX-<millis>-<rand>`.
///
/// The millisecond component keeps ids roughly sortable by creation time;
/// the random suffix disambiguates ids minted within the same millisecond.
pub fn new_id(prefix: &str) -> String {
    let millis = Utc::now().timestamp_millis();
    let rand = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{millis}-{}", &rand[..8])
}

/// Check whether an id carries the expected type prefix.
pub fn has_prefix(id: &str, prefix: &str) -> bool {
    id.starts_with(prefix) && id.as_bytes().get(prefix.len()) == Some(&b'-')
}
