use ulid::Ulid;

pub fn new_task_id() -> String {
    format!("tsk_{}", Ulid::new())
}

pub fn new_tree_id() -> String {
    format!("tre_{}", Ulid::new())
}

/// Lowercase alphanumeric suffix of `len` characters drawn from a fresh ULID.
pub fn rand_suffix(len: usize) -> String {
    let s = Ulid::new().to_string().to_ascii_lowercase();
    let start = s.len().saturating_sub(len);
    s[start..].to_string()
}

pub fn now_rfc3339() -> anyhow::Result<String> {
    Ok(time::OffsetDateTime::now_utc().format(&time::format_description::well_known::Rfc3339)?)
}

/// `YYYYMMDDHHMMSS` in UTC, used in artifact file names.
pub fn slim_timestamp() -> anyhow::Result<String> {
    let fmt = time::macros::format_description!("[year][month][day][hour][minute][second]");
    Ok(time::OffsetDateTime::now_utc().format(&fmt)?)
}
