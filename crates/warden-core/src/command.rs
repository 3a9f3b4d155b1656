//! Command description for supervised child processes.
//!
//! A [`Command`] is a plain value: argument vector, environment overrides,
//! spawn flags and an optional working directory. The supervisor clones it at
//! spawn time, so later mutation by the caller never reaches a running child.

use std::path::{Path, PathBuf};

/// Spawn behaviour flags.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpawnFlags(pub u32);

impl SpawnFlags {
    /// Resolve a bare program name through `PATH`.
    pub const SEARCH_PATH: u32 = 0x01;
    /// Child reads stdin from /dev/null instead of a pipe.
    pub const STDIN_FROM_DEV_NULL: u32 = 0x02;
    /// Child stdout goes to /dev/null instead of a pipe.
    pub const STDOUT_TO_DEV_NULL: u32 = 0x04;
    /// Child stderr goes to /dev/null instead of a pipe.
    pub const STDERR_TO_DEV_NULL: u32 = 0x08;
    /// Child shares the parent's stdin.
    pub const CHILD_INHERITS_STDIN: u32 = 0x10;
    /// Child becomes leader of a new process group.
    pub const NEW_PROCESS_GROUP: u32 = 0x20;

    const NAMES: [(&'static str, u32); 6] = [
        ("search-path", Self::SEARCH_PATH),
        ("stdin-from-dev-null", Self::STDIN_FROM_DEV_NULL),
        ("stdout-to-dev-null", Self::STDOUT_TO_DEV_NULL),
        ("stderr-to-dev-null", Self::STDERR_TO_DEV_NULL),
        ("child-inherits-stdin", Self::CHILD_INHERITS_STDIN),
        ("new-process-group", Self::NEW_PROCESS_GROUP),
    ];

    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, bit: u32) -> bool {
        self.0 & bit == bit
    }

    #[must_use]
    pub const fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }

    #[must_use]
    pub const fn without(self, bit: u32) -> Self {
        Self(self.0 & !bit)
    }

    /// Parse a flag list such as `"search-path, stdout_to_dev_null"`.
    ///
    /// Separators are commas, pipes or whitespace; names are case-insensitive
    /// and `_` is accepted for `-`. Unknown names are ignored, and `all`
    /// selects every flag.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let mut flags = Self::empty();
        for token in s.split(|c: char| c == ',' || c == '|' || c.is_whitespace()) {
            let token = token.trim().to_ascii_lowercase().replace('_', "-");
            if token.is_empty() {
                continue;
            }
            if token == "all" {
                for (_, bit) in Self::NAMES {
                    flags = flags.with(bit);
                }
                continue;
            }
            if let Some((_, bit)) = Self::NAMES.iter().find(|(name, _)| *name == token) {
                flags = flags.with(*bit);
            }
        }
        flags
    }

    /// Names of the set flags, in declaration order.
    #[must_use]
    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(_, bit)| self.contains(*bit))
            .map(|(name, _)| *name)
            .collect()
    }
}

/// Ordered environment overrides with upsert/remove semantics.
///
/// Each variable keeps the position where it was first mentioned; later
/// `set`/`unset` calls on the same name update that entry in place.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EnvOverrides {
    entries: Vec<(String, Option<String>)>,
}

impl EnvOverrides {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace `name=value`.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.upsert(name.into(), Some(value.into()));
    }

    /// Remove `name` from the child's environment, even if inherited.
    pub fn unset(&mut self, name: impl Into<String>) {
        self.upsert(name.into(), None);
    }

    /// The override for `name`: `Some(Some(v))` set, `Some(None)` removed.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Option<&str>> {
        self.entries
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_deref())
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&str>)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_deref()))
    }

    /// Merge the overrides onto `inherited`, preserving first-seen order.
    ///
    /// Inherited variables keep their order; overridden ones are updated in
    /// place; new ones are appended in the order they were first set.
    pub fn apply<I, K, V>(&self, inherited: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut merged: Vec<(String, String)> = Vec::new();
        for (k, v) in inherited {
            let k = k.into();
            let v = v.into();
            match merged.iter_mut().find(|(name, _)| *name == k) {
                Some(slot) => slot.1 = v,
                None => merged.push((k, v)),
            }
        }

        for (name, value) in &self.entries {
            match value {
                Some(value) => match merged.iter_mut().find(|(k, _)| k == name) {
                    Some(slot) => slot.1.clone_from(value),
                    None => merged.push((name.clone(), value.clone())),
                },
                None => merged.retain(|(k, _)| k != name),
            }
        }
        merged
    }

    fn upsert(&mut self, name: String, value: Option<String>) {
        match self.entries.iter_mut().find(|(k, _)| *k == name) {
            Some(slot) => slot.1 = value,
            None => self.entries.push((name, value)),
        }
    }
}

/// Render `(name, value)` pairs as `NAME=VALUE` entries.
#[must_use]
pub fn materialize_environment(vars: &[(String, String)]) -> Vec<String> {
    vars.iter().map(|(k, v)| format!("{k}={v}")).collect()
}

/// Description of a child process to spawn.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Command {
    args: Vec<String>,
    env: EnvOverrides,
    flags: SpawnFlags,
    cwd: Option<PathBuf>,
}

impl Command {
    /// Command whose argv[0] is `program`, with `SEARCH_PATH` set.
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            args: vec![program.into()],
            flags: SpawnFlags(SpawnFlags::SEARCH_PATH),
            ..Self::default()
        }
    }

    /// Command from a full argument vector, with `SEARCH_PATH` set.
    ///
    /// An empty vector is allowed here; spawning it is rejected.
    pub fn from_args<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            flags: SpawnFlags(SpawnFlags::SEARCH_PATH),
            ..Self::default()
        }
    }

    pub fn arg(&mut self, arg: impl Into<String>) -> &mut Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(&mut self, name: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.env.set(name, value);
        self
    }

    pub fn env_remove(&mut self, name: impl Into<String>) -> &mut Self {
        self.env.unset(name);
        self
    }

    pub fn flags(&mut self, flags: SpawnFlags) -> &mut Self {
        self.flags = flags;
        self
    }

    pub fn current_dir(&mut self, dir: impl AsRef<Path>) -> &mut Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    /// argv[0], if any.
    #[must_use]
    pub fn program(&self) -> Option<&str> {
        self.args.first().map(String::as_str)
    }

    #[must_use]
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    #[must_use]
    pub fn get_env(&self) -> &EnvOverrides {
        &self.env
    }

    #[must_use]
    pub fn get_flags(&self) -> SpawnFlags {
        self.flags
    }

    #[must_use]
    pub fn get_current_dir(&self) -> Option<&Path> {
        self.cwd.as_deref()
    }

    /// Effective child environment: `inherited` plus overrides.
    pub fn effective_environment<I, K, V>(&self, inherited: I) -> Vec<(String, String)>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env.apply(inherited)
    }

    /// Shell-ish rendering for diagnostics.
    #[must_use]
    pub fn display(&self) -> String {
        self.args
            .iter()
            .map(|a| {
                if a.is_empty() || a.chars().any(|c| c.is_whitespace() || c == '"') {
                    format!("{a:?}")
                } else {
                    a.clone()
                }
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_parse_loosely() {
        let flags = SpawnFlags::from_str_loose("search-path, STDOUT_TO_DEV_NULL|bogus");
        assert!(flags.contains(SpawnFlags::SEARCH_PATH));
        assert!(flags.contains(SpawnFlags::STDOUT_TO_DEV_NULL));
        assert!(!flags.contains(SpawnFlags::STDERR_TO_DEV_NULL));
        assert_eq!(flags.names(), vec!["search-path", "stdout-to-dev-null"]);

        assert_eq!(SpawnFlags::from_str_loose(""), SpawnFlags::empty());
        assert_eq!(SpawnFlags::from_str_loose("all").names().len(), 6);
    }

    #[test]
    fn flags_with_and_without() {
        let flags = SpawnFlags::empty()
            .with(SpawnFlags::NEW_PROCESS_GROUP)
            .with(SpawnFlags::SEARCH_PATH)
            .without(SpawnFlags::SEARCH_PATH);
        assert!(flags.contains(SpawnFlags::NEW_PROCESS_GROUP));
        assert!(!flags.contains(SpawnFlags::SEARCH_PATH));
    }

    #[test]
    fn overrides_upsert_in_first_seen_order() {
        let mut env = EnvOverrides::new();
        env.set("B", "1");
        env.set("A", "2");
        env.set("B", "3");
        let pairs: Vec<_> = env.iter().collect();
        assert_eq!(pairs, vec![("B", Some("3")), ("A", Some("2"))]);
    }

    #[test]
    fn overrides_apply_onto_inherited() {
        let mut env = EnvOverrides::new();
        env.set("HOME", "/tmp/home");
        env.unset("SECRET");
        env.set("NEW", "yes");

        let merged = env.apply([("PATH", "/bin"), ("HOME", "/root"), ("SECRET", "x")]);
        assert_eq!(
            merged,
            vec![
                ("PATH".to_string(), "/bin".to_string()),
                ("HOME".to_string(), "/tmp/home".to_string()),
                ("NEW".to_string(), "yes".to_string()),
            ]
        );
        assert_eq!(
            materialize_environment(&merged),
            vec!["PATH=/bin", "HOME=/tmp/home", "NEW=yes"]
        );
    }

    #[test]
    fn unset_then_set_restores_variable() {
        let mut env = EnvOverrides::new();
        env.unset("X");
        env.set("X", "back");
        assert_eq!(env.get("X"), Some(Some("back")));
        assert_eq!(
            env.apply([("X", "old")]),
            vec![("X".to_string(), "back".to_string())]
        );
    }

    #[test]
    fn command_builder_and_snapshot() {
        let mut cmd = Command::new("printf");
        cmd.arg("%s").arg("hello").env("LANG", "C");
        let snapshot = cmd.clone();
        cmd.arg("mutated");

        assert_eq!(snapshot.program(), Some("printf"));
        assert_eq!(snapshot.get_args(), ["printf", "%s", "hello"]);
        assert!(snapshot.get_flags().contains(SpawnFlags::SEARCH_PATH));
        assert_eq!(cmd.get_args().len(), 4);
    }

    #[test]
    fn empty_command_has_no_program() {
        let cmd = Command::from_args(Vec::<String>::new());
        assert_eq!(cmd.program(), None);
    }

    #[test]
    fn display_quotes_awkward_arguments() {
        let cmd = Command::from_args(["sh", "-c", "echo hi"]);
        assert_eq!(cmd.display(), "sh -c \"echo hi\"");
    }
}
