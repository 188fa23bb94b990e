//! PROCESS-NAME / PROCESS-PATH matchers.
//!
//! Grounded in `original_source/rule/process.go` (SPEC_FULL.md §4.4
//! supplement): `PROCESS-NAME` compares the basename case-sensitively,
//! `PROCESS-PATH` compares the full path; both never match when the
//! metadata carries no process path (process lookup is an external
//! collaborator per §6 — this crate never performs the lookup itself).

pub fn process_name_matches(process_path: Option<&str>, payload: &str) -> bool {
    let Some(path) = process_path else { return false };
    let basename = path.rsplit(['/', '\\']).next().unwrap_or(path);
    basename == payload
}

pub fn process_path_matches(process_path: Option<&str>, payload: &str) -> bool {
    process_path == Some(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_matches_basename_only() {
        assert!(process_name_matches(Some("/usr/bin/curl"), "curl"));
        assert!(!process_name_matches(Some("/usr/bin/curl"), "/usr/bin/curl"));
    }

    #[test]
    fn absent_process_path_never_matches() {
        assert!(!process_name_matches(None, "curl"));
        assert!(!process_path_matches(None, "/usr/bin/curl"));
    }
}
