//! Identifier rules shared by graphs, runs and gates.
//!
//! Step, gate and run ids become directory names under the run root, so they
//! are restricted to a filesystem-safe alphabet.

use anyhow::{Result, anyhow};

/// Validate that an id is safe for use as a single path component.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(anyhow!("id must not be empty"));
    }
    if id.contains('/') {
        return Err(anyhow!("id must not contain '/'"));
    }
    if id == "." || id == ".." {
        return Err(anyhow!("id must not be '.' or '..'"));
    }
    if id
        .chars()
        .any(|c| !(c.is_ascii_alphanumeric() || c == '.' || c == '_' || c == '-'))
    {
        return Err(anyhow!("id must be [A-Za-z0-9._-] only (got '{id}')"));
    }
    Ok(())
}

/// Producer label for artifacts written on behalf of a step.
pub fn step_producer(step_id: &str) -> String {
    format!("step:{step_id}")
}

/// Producer label for artifacts written on behalf of a gate.
pub fn gate_producer(gate_id: &str) -> String {
    format!("gate:{gate_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_id_rejects_slash() {
        let err = validate_id("bad/id").unwrap_err();
        assert!(err.to_string().contains("must not contain"));
    }

    #[test]
    fn validate_id_rejects_dot_dirs() {
        assert!(validate_id("..").is_err());
        assert!(validate_id(".").is_err());
    }

    #[test]
    fn validate_id_accepts_slug() {
        validate_id("build-step_1.v2").expect("valid id");
    }
}
