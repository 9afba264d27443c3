use std::env;
use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::sys::signal::Signal;
use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer};

use super::error::ConfigError;

const DEFAULT_UMASK: u32 = 0o022;
const DEFAULT_STOPTIME: u64 = 10;

/// Program identifier, unique within a configuration.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProgramName(String);

impl TryFrom<String> for ProgramName {
    type Error = ConfigError;

    fn try_from(str: String) -> Result<Self, Self::Error> {
        if str.is_empty() || str.len() > 64 {
            return Err(ConfigError::InvalidProgramName(str));
        }
        if str.chars().all(|x| x.is_ascii_alphanumeric() || x.eq(&'_')) {
            Ok(ProgramName(str))
        } else {
            Err(ConfigError::InvalidProgramName(str))
        }
    }
}

impl Deref for ProgramName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for ProgramName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.as_str())
    }
}

/// Signal sent on a graceful stop, named without the `SIG` prefix in the
/// config file (`INT`, `TERM`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopSignal(pub Signal);

impl Default for StopSignal {
    fn default() -> Self {
        StopSignal(Signal::SIGINT)
    }
}

impl StopSignal {
    fn parse(name: &str, value: &str) -> Result<Self, ConfigError> {
        Signal::from_str(&format!("SIG{value}"))
            .map(StopSignal)
            .map_err(|_| ConfigError::InvalidStopSignal {
                name: name.to_string(),
                signal: value.to_string(),
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoRestart {
    True,
    #[default]
    False,
    Unexpected,
}

/// `autorestart` is either a YAML boolean or the string `unexpected`.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AutoRestartField {
    Bool(bool),
    Word(String),
}

/// `umask` is either a YAML integer whose decimal digits are octal
/// (`644` means 0o644) or a string parsed in base 8 (`"022"`).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UmaskField {
    Int(u64),
    Word(String),
}

/// One program record as it appears in the configuration file, before
/// validation. Unknown fields are rejected.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub(super) struct RawProgram {
    cmd: String,
    workingdir: Option<PathBuf>,
    stdout: Option<PathBuf>,
    stderr: Option<PathBuf>,
    stopsignal: Option<String>,
    numprocs: Option<u32>,
    starttime: Option<u64>,
    startretries: Option<u32>,
    stoptime: Option<u64>,
    umask: Option<UmaskField>,
    autostart: Option<bool>,
    autorestart: Option<AutoRestartField>,
    #[serde(default, deserialize_with = "ordered_pairs_opt")]
    env: Option<Vec<(String, String)>>,
    exitcodes: Option<Vec<u8>>,
}

/// Deserializes a YAML mapping into pairs in declaration order; a map
/// type would resort the keys.
pub(super) fn ordered_pairs<'de, D, V>(deserializer: D) -> Result<Vec<(String, V)>, D::Error>
where
    D: Deserializer<'de>,
    V: Deserialize<'de>,
{
    struct PairsVisitor<V>(PhantomData<V>);

    impl<'de, V: Deserialize<'de>> Visitor<'de> for PairsVisitor<V> {
        type Value = Vec<(String, V)>;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("a mapping")
        }

        fn visit_map<M: MapAccess<'de>>(self, mut map: M) -> Result<Self::Value, M::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some(entry) = map.next_entry()? {
                entries.push(entry);
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(PairsVisitor(PhantomData))
}

fn ordered_pairs_opt<'de, D>(deserializer: D) -> Result<Option<Vec<(String, String)>>, D::Error>
where
    D: Deserializer<'de>,
{
    ordered_pairs(deserializer).map(Some)
}

/// Immutable per-program configuration, shared by every replica in a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgramConfig {
    pub name: ProgramName,
    pub argv: Vec<String>,
    pub exec_path: PathBuf,
    pub workingdir: Option<PathBuf>,
    pub stdout_path: Option<PathBuf>,
    pub stderr_path: Option<PathBuf>,
    pub stopsignal: StopSignal,
    pub numprocs: u32,
    pub starttime: u64,
    pub startretries: u32,
    pub stoptime: u64,
    pub umask: u32,
    pub autostart: bool,
    pub autorestart: AutoRestart,
    pub env: Vec<(String, String)>,
    pub exitcodes: Vec<u8>,
}

impl ProgramConfig {
    pub(super) fn from_raw(name: ProgramName, raw: RawProgram) -> Result<Self, ConfigError> {
        let argv = split_command_words(&raw.cmd, &name)?;
        let exec_path = resolve_exec_path(&argv[0], &name)?;

        if let Some(dir) = &raw.workingdir {
            if !dir.is_dir() {
                return Err(ConfigError::InvalidWorkingDir {
                    name: name.to_string(),
                    dir: dir.clone(),
                });
            }
        }

        let stopsignal = match &raw.stopsignal {
            Some(value) => StopSignal::parse(&name, value)?,
            None => StopSignal::default(),
        };

        let numprocs = raw.numprocs.unwrap_or(1);
        if numprocs < 1 {
            return Err(ConfigError::InvalidNumProcs(name.to_string()));
        }

        let stoptime = raw.stoptime.unwrap_or(DEFAULT_STOPTIME);
        if stoptime < 1 {
            return Err(ConfigError::InvalidStopTime(name.to_string()));
        }

        let umask = match raw.umask {
            None => DEFAULT_UMASK,
            Some(UmaskField::Int(n)) => parse_umask(&name, &n.to_string())?,
            Some(UmaskField::Word(s)) => parse_umask(&name, &s)?,
        };

        let autorestart = match raw.autorestart {
            None => AutoRestart::default(),
            Some(AutoRestartField::Bool(true)) => AutoRestart::True,
            Some(AutoRestartField::Bool(false)) => AutoRestart::False,
            Some(AutoRestartField::Word(w)) => match w.to_lowercase().as_str() {
                "true" => AutoRestart::True,
                "false" => AutoRestart::False,
                "unexpected" => AutoRestart::Unexpected,
                _ => {
                    return Err(ConfigError::InvalidAutoRestart {
                        name: name.to_string(),
                        value: w,
                    })
                }
            },
        };

        Ok(ProgramConfig {
            name,
            argv,
            exec_path,
            workingdir: raw.workingdir,
            stdout_path: raw.stdout,
            stderr_path: raw.stderr,
            stopsignal,
            numprocs,
            starttime: raw.starttime.unwrap_or(0),
            startretries: raw.startretries.unwrap_or(0),
            stoptime,
            umask,
            autostart: raw.autostart.unwrap_or(true),
            autorestart,
            env: raw.env.unwrap_or_default(),
            exitcodes: raw.exitcodes.unwrap_or_else(|| vec![0]),
        })
    }
}

fn parse_umask(name: &ProgramName, value: &str) -> Result<u32, ConfigError> {
    u32::from_str_radix(value, 8)
        .ok()
        .filter(|mask| *mask <= 0o777)
        .ok_or_else(|| ConfigError::InvalidUmask {
            name: name.to_string(),
            value: value.to_string(),
        })
}

/// Shell-style word splitting of the `cmd` string: whitespace separates
/// words, single quotes are literal, double quotes and bare backslashes
/// escape.
fn split_command_words(cmd: &str, name: &ProgramName) -> Result<Vec<String>, ConfigError> {
    let mut words: Vec<String> = Vec::new();
    let mut current: Option<String> = None;
    let mut chars = cmd.chars();

    while let Some(c) = chars.next() {
        match c {
            ' ' | '\t' => {
                if let Some(word) = current.take() {
                    words.push(word);
                }
            }
            '\'' => {
                let word = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(inner) => word.push(inner),
                        None => return Err(ConfigError::UnterminatedQuote(name.to_string())),
                    }
                }
            }
            '"' => {
                let word = current.get_or_insert_with(String::new);
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(escaped) => word.push(escaped),
                            None => return Err(ConfigError::UnterminatedQuote(name.to_string())),
                        },
                        Some(inner) => word.push(inner),
                        None => return Err(ConfigError::UnterminatedQuote(name.to_string())),
                    }
                }
            }
            '\\' => match chars.next() {
                Some(escaped) => current.get_or_insert_with(String::new).push(escaped),
                None => return Err(ConfigError::UnterminatedQuote(name.to_string())),
            },
            _ => current.get_or_insert_with(String::new).push(c),
        }
    }
    if let Some(word) = current.take() {
        words.push(word);
    }
    if words.is_empty() {
        return Err(ConfigError::EmptyCommand(name.to_string()));
    }
    Ok(words)
}

/// An explicit `/` means the path is used as-is; otherwise `PATH` is
/// searched, at parse time, so a missing binary is a config error rather
/// than a spawn-time surprise.
fn resolve_exec_path(word: &str, name: &ProgramName) -> Result<PathBuf, ConfigError> {
    let not_found = || ConfigError::ExecutableNotFound {
        name: name.to_string(),
        word: word.to_string(),
    };

    if word.contains('/') {
        let path = PathBuf::from(word);
        if is_executable(&path) {
            return Ok(path);
        }
        return Err(not_found());
    }

    let path_var = env::var_os("PATH").unwrap_or_default();
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join(word);
        if is_executable(&candidate) {
            return Ok(candidate);
        }
    }
    Err(not_found())
}

fn is_executable(path: &Path) -> bool {
    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn name(s: &str) -> ProgramName {
        ProgramName::try_from(s.to_string()).unwrap()
    }

    fn minimal_raw(cmd: &str) -> RawProgram {
        RawProgram {
            cmd: cmd.to_string(),
            workingdir: None,
            stdout: None,
            stderr: None,
            stopsignal: None,
            numprocs: None,
            starttime: None,
            startretries: None,
            stoptime: None,
            umask: None,
            autostart: None,
            autorestart: None,
            env: None,
            exitcodes: None,
        }
    }

    #[test]
    fn program_name_charset() {
        assert!(ProgramName::try_from("web_1".to_string()).is_ok());
        assert_matches!(
            ProgramName::try_from("web-1".to_string()),
            Err(ConfigError::InvalidProgramName(_))
        );
        assert_matches!(
            ProgramName::try_from(String::new()),
            Err(ConfigError::InvalidProgramName(_))
        );
        assert_matches!(
            ProgramName::try_from("x".repeat(65)),
            Err(ConfigError::InvalidProgramName(_))
        );
    }

    #[test]
    fn defaults_are_applied() {
        let config = ProgramConfig::from_raw(name("web"), minimal_raw("/bin/sleep 1")).unwrap();
        assert_eq!(config.numprocs, 1);
        assert_eq!(config.starttime, 0);
        assert_eq!(config.startretries, 0);
        assert_eq!(config.umask, 0o022);
        assert!(config.autostart);
        assert_eq!(config.autorestart, AutoRestart::False);
        assert_eq!(config.exitcodes, vec![0]);
        assert_eq!(config.stopsignal, StopSignal(Signal::SIGINT));
    }

    #[test]
    fn word_splitting_honors_quotes() {
        let config =
            ProgramConfig::from_raw(name("e"), minimal_raw(r#"/bin/echo 'a b' "c\"d" e\ f"#))
                .unwrap();
        assert_eq!(config.argv, vec!["/bin/echo", "a b", "c\"d", "e f"]);
    }

    #[test]
    fn unterminated_quote_is_rejected() {
        assert_matches!(
            ProgramConfig::from_raw(name("e"), minimal_raw("/bin/echo 'oops")),
            Err(ConfigError::UnterminatedQuote(_))
        );
    }

    #[test]
    fn empty_command_is_rejected() {
        assert_matches!(
            ProgramConfig::from_raw(name("e"), minimal_raw("   ")),
            Err(ConfigError::EmptyCommand(_))
        );
    }

    #[test]
    fn path_resolution_finds_sleep() {
        let config = ProgramConfig::from_raw(name("s"), minimal_raw("sleep 1")).unwrap();
        assert!(config.exec_path.is_absolute());
        assert_eq!(config.argv[0], "sleep");
    }

    #[test]
    fn missing_binary_is_rejected() {
        assert_matches!(
            ProgramConfig::from_raw(name("s"), minimal_raw("no_such_binary_here")),
            Err(ConfigError::ExecutableNotFound { .. })
        );
        assert_matches!(
            ProgramConfig::from_raw(name("s"), minimal_raw("/no/such/binary")),
            Err(ConfigError::ExecutableNotFound { .. })
        );
    }

    #[test]
    fn workingdir_must_exist() {
        let mut raw = minimal_raw("/bin/sleep 1");
        raw.workingdir = Some(PathBuf::from("/no/such/dir"));
        assert_matches!(
            ProgramConfig::from_raw(name("w"), raw),
            Err(ConfigError::InvalidWorkingDir { .. })
        );
    }

    #[test]
    fn stopsignal_names() {
        let mut raw = minimal_raw("/bin/sleep 1");
        raw.stopsignal = Some("TERM".to_string());
        let config = ProgramConfig::from_raw(name("s"), raw).unwrap();
        assert_eq!(config.stopsignal, StopSignal(Signal::SIGTERM));

        let mut raw = minimal_raw("/bin/sleep 1");
        raw.stopsignal = Some("NOPE".to_string());
        assert_matches!(
            ProgramConfig::from_raw(name("s"), raw),
            Err(ConfigError::InvalidStopSignal { .. })
        );
    }

    #[test]
    fn umask_octal_forms() {
        let mut raw = minimal_raw("/bin/sleep 1");
        raw.umask = Some(UmaskField::Int(22));
        assert_eq!(
            ProgramConfig::from_raw(name("u"), raw).unwrap().umask,
            0o022
        );

        let mut raw = minimal_raw("/bin/sleep 1");
        raw.umask = Some(UmaskField::Word("077".to_string()));
        assert_eq!(
            ProgramConfig::from_raw(name("u"), raw).unwrap().umask,
            0o077
        );

        let mut raw = minimal_raw("/bin/sleep 1");
        raw.umask = Some(UmaskField::Word("9".to_string()));
        assert_matches!(
            ProgramConfig::from_raw(name("u"), raw),
            Err(ConfigError::InvalidUmask { .. })
        );
    }

    #[test]
    fn stoptime_lower_bound() {
        let mut raw = minimal_raw("/bin/sleep 1");
        raw.stoptime = Some(0);
        assert_matches!(
            ProgramConfig::from_raw(name("s"), raw),
            Err(ConfigError::InvalidStopTime(_))
        );
    }
}
