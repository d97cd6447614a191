//! Engine resolution: machine engine priority → command wrapper.

/// A command wrapper that launches one engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineWrapper {
    /// Engine name as listed in machine priorities.
    pub engine: &'static str,
    /// Wrapper command invoked on the target.
    pub command: &'static str,
}

/// Wrapper used when no listed engine is recognised.
pub const DEFAULT_WRAPPER: EngineWrapper = EngineWrapper {
    engine: "claude",
    command: "itachi",
};

const KNOWN_WRAPPERS: &[EngineWrapper] = &[
    DEFAULT_WRAPPER,
    EngineWrapper {
        engine: "codex",
        command: "itachic",
    },
    EngineWrapper {
        engine: "gemini",
        command: "itachig",
    },
];

/// Look up the wrapper for a single engine name (case-insensitive).
pub fn wrapper_for(engine: &str) -> Option<EngineWrapper> {
    let name = engine.trim();
    KNOWN_WRAPPERS
        .iter()
        .find(|w| w.engine.eq_ignore_ascii_case(name))
        .copied()
}

/// Pick the first engine in `priority` with a known wrapper, or the default.
pub fn resolve_engine<S: AsRef<str>>(priority: &[S]) -> EngineWrapper {
    priority
        .iter()
        .find_map(|engine| wrapper_for(engine.as_ref()))
        .unwrap_or(DEFAULT_WRAPPER)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_engines_map_to_distinct_wrappers() {
        assert_eq!(resolve_engine(&["claude"]).command, "itachi");
        assert_eq!(resolve_engine(&["codex"]).command, "itachic");
        assert_eq!(resolve_engine(&["gemini"]).command, "itachig");
    }

    #[test]
    fn empty_priority_uses_default() {
        let empty: [&str; 0] = [];
        assert_eq!(resolve_engine(&empty), DEFAULT_WRAPPER);
    }

    #[test]
    fn unknown_engines_use_default() {
        for name in ["aider", "cursor", "", "claude-code", "gpt"] {
            assert_eq!(resolve_engine(&[name]), DEFAULT_WRAPPER, "{name}");
        }
    }

    #[test]
    fn first_known_entry_wins() {
        let priority = vec!["aider".to_string(), "gemini".into(), "codex".into()];
        assert_eq!(resolve_engine(&priority).command, "itachig");
    }

    #[test]
    fn lookup_is_case_insensitive() {
        assert_eq!(resolve_engine(&["Codex "]).command, "itachic");
    }
}
