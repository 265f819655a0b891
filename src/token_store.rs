use std::fs::{self, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::hw::DeviceAddress;

const TOKENS_FILE_NAME: &str = "tokens.conf";
const TOKENS_SECTION: &str = "tokens";
const TOKEN_LEN: usize = 16;

/// Errors returned when parsing an authentication token.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum AuthTokenError {
    #[error("token is not valid hex")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("token must be 16 bytes, got {actual}")]
    InvalidLength { actual: usize },
}

/// Errors returned by the token store.
#[derive(Debug, Error)]
pub enum TokenStoreError {
    #[error("failed to access token store `{}`", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("token store line {line} is not a `key = value` record")]
    InvalidRecord { line: usize },
    #[error("stored token for `{address}` is malformed")]
    InvalidToken {
        address: DeviceAddress,
        #[source]
        source: AuthTokenError,
    },
}

/// Device-issued authentication token.
///
/// The value is never rendered by `Debug` and has no `Display`, so it cannot
/// leak through structured logs.
#[derive(Clone, Copy, Eq, PartialEq, Hash)]
pub struct AuthToken([u8; TOKEN_LEN]);

impl AuthToken {
    /// Builds a token from its raw on-wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error when `bytes` is not exactly 16 bytes long.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, AuthTokenError> {
        let raw = bytes
            .try_into()
            .map_err(|_error| AuthTokenError::InvalidLength {
                actual: bytes.len(),
            })?;
        Ok(Self(raw))
    }

    /// Returns the raw token bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    pub(crate) fn as_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("AuthToken(<redacted>)")
    }
}

impl FromStr for AuthToken {
    type Err = AuthTokenError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(value.trim())?;
        Self::from_slice(&bytes)
    }
}

/// Per-device token persistence in an INI-style file.
///
/// Tokens live in a `[tokens]` section keyed by normalised address. Other
/// sections, comments and unrelated keys survive every rewrite.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct TokenStore {
    path: PathBuf,
}

impl TokenStore {
    /// Opens a store backed by `path`. The file is created lazily on first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Opens the store at the per-user default location.
    #[must_use]
    pub fn at_default_path() -> Self {
        Self::new(default_path())
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Loads the token stored for `address`.
    ///
    /// A missing file means no device has a token yet.
    ///
    /// # Errors
    ///
    /// Returns an error when the file cannot be read, the `[tokens]` section
    /// contains a malformed record, or the stored value is not a token.
    #[instrument(skip(self), level = "debug", fields(path = %self.path.display()))]
    pub fn load(&self, address: &DeviceAddress) -> Result<Option<AuthToken>, TokenStoreError> {
        let Some(contents) = self.read_contents()? else {
            debug!("token store does not exist yet");
            return Ok(None);
        };

        let document = Document::parse(&contents);
        let Some(value) = document.token_value(address)? else {
            return Ok(None);
        };

        value
            .parse()
            .map(Some)
            .map_err(|source| TokenStoreError::InvalidToken {
                address: address.clone(),
                source,
            })
    }

    /// Returns whether a token is stored for `address`.
    ///
    /// # Errors
    ///
    /// Returns an error under the same conditions as [`TokenStore::load`].
    pub fn contains(&self, address: &DeviceAddress) -> Result<bool, TokenStoreError> {
        Ok(self.load(address)?.is_some())
    }

    /// Stores `token` for `address`, replacing any previous token.
    ///
    /// # Errors
    ///
    /// Returns an error when the file or its parent directory cannot be
    /// written.
    #[instrument(skip(self, token), level = "debug", fields(path = %self.path.display()))]
    pub fn save(&self, address: &DeviceAddress, token: &AuthToken) -> Result<(), TokenStoreError> {
        let contents = self.read_contents()?.unwrap_or_default();
        let mut document = Document::parse(&contents);
        document.upsert_token(address, token);
        self.write_contents(&document.render())?;
        debug!("persisted device token");
        Ok(())
    }

    fn read_contents(&self) -> Result<Option<String>, TokenStoreError> {
        match fs::read_to_string(&self.path) {
            Ok(contents) => Ok(Some(contents)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(self.io_error(source)),
        }
    }

    fn write_contents(&self, contents: &str) -> Result<(), TokenStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|source| self.io_error(source))?;
        }

        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt as _;
            options.mode(0o600);
        }

        let mut file = options
            .open(&self.path)
            .map_err(|source| self.io_error(source))?;
        // `mode` only applies on creation; tighten files written by older tools too.
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt as _;
            file.set_permissions(fs::Permissions::from_mode(0o600))
                .map_err(|source| self.io_error(source))?;
        }
        file.write_all(contents.as_bytes())
            .map_err(|source| self.io_error(source))?;
        file.sync_all().map_err(|source| self.io_error(source))
    }

    fn io_error(&self, source: std::io::Error) -> TokenStoreError {
        TokenStoreError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

/// Returns the per-user default token store location.
#[must_use]
pub fn default_path() -> PathBuf {
    let Some(project_dirs) = ProjectDirs::from("io", "microbot", "microbot") else {
        return std::env::temp_dir()
            .join("microbot")
            .join(TOKENS_FILE_NAME);
    };
    project_dirs.config_dir().join(TOKENS_FILE_NAME)
}

/// Line-preserving view of an INI document.
#[derive(Debug)]
struct Document {
    lines: Vec<String>,
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Line<'a> {
    Blank,
    Comment,
    Section(&'a str),
    Entry { key: &'a str, value: &'a str },
    Invalid,
}

fn classify(raw: &str) -> Line<'_> {
    let line = raw.trim();
    if line.is_empty() {
        return Line::Blank;
    }
    if line.starts_with('#') || line.starts_with(';') {
        return Line::Comment;
    }
    if let Some(name) = line.strip_prefix('[').and_then(|rest| rest.strip_suffix(']')) {
        return Line::Section(name.trim());
    }
    match line.find(['=', ':']) {
        Some(split) => Line::Entry {
            key: line[..split].trim(),
            value: line[split + 1..].trim(),
        },
        None => Line::Invalid,
    }
}

impl Document {
    fn parse(contents: &str) -> Self {
        Self {
            lines: contents.lines().map(str::to_string).collect(),
        }
    }

    /// Index range of the body of the `[tokens]` section, if present.
    fn tokens_section(&self) -> Option<(usize, usize)> {
        let header = self.lines.iter().position(|line| {
            matches!(classify(line), Line::Section(name) if name.eq_ignore_ascii_case(TOKENS_SECTION))
        })?;
        let end = self.lines[header + 1..]
            .iter()
            .position(|line| matches!(classify(line), Line::Section(_)))
            .map_or(self.lines.len(), |offset| header + 1 + offset);
        Some((header + 1, end))
    }

    fn token_value(&self, address: &DeviceAddress) -> Result<Option<&str>, TokenStoreError> {
        let Some((start, end)) = self.tokens_section() else {
            return Ok(None);
        };

        let mut found = None;
        for (index, raw) in self.lines[start..end].iter().enumerate() {
            match classify(raw) {
                Line::Entry { key, value } if address.matches(key) => found = Some(value),
                Line::Invalid => {
                    return Err(TokenStoreError::InvalidRecord {
                        line: start + index + 1,
                    });
                }
                _ => {}
            }
        }
        Ok(found)
    }

    fn upsert_token(&mut self, address: &DeviceAddress, token: &AuthToken) {
        let entry = format!("{address} = {}", token.as_hex());

        let Some((start, end)) = self.tokens_section() else {
            if self.lines.last().is_some_and(|line| !line.trim().is_empty()) {
                self.lines.push(String::new());
            }
            self.lines.push(format!("[{TOKENS_SECTION}]"));
            self.lines.push(entry);
            return;
        };

        let existing = (start..end).find(|index| {
            matches!(classify(&self.lines[*index]), Line::Entry { key, .. } if address.matches(key))
        });
        if let Some(index) = existing {
            self.lines[index] = entry;
            return;
        }

        let insert_at = (start..end)
            .rev()
            .find(|index| !matches!(classify(&self.lines[*index]), Line::Blank))
            .map_or(start, |index| index + 1);
        self.lines.insert(insert_at, entry);
    }

    fn render(&self) -> String {
        let mut rendered = self.lines.join("\n");
        rendered.push('\n');
        rendered
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use tempfile::TempDir;

    use super::*;

    fn address(raw: &str) -> DeviceAddress {
        raw.parse().expect("address should parse")
    }

    fn token(raw: &str) -> AuthToken {
        raw.parse().expect("token should parse")
    }

    fn store_in(dir: &TempDir) -> TokenStore {
        TokenStore::new(dir.path().join("nested").join(TOKENS_FILE_NAME))
    }

    #[test]
    fn load_from_missing_file_returns_none() {
        let dir = TempDir::new().expect("tempdir should be created");
        let store = store_in(&dir);

        let loaded = store
            .load(&address("AA:BB:CC:DD:EE:FF"))
            .expect("missing store should load");
        assert_eq!(None, loaded);
    }

    #[test]
    fn save_then_load_preserves_other_devices() {
        let dir = TempDir::new().expect("tempdir should be created");
        let store = store_in(&dir);
        let first = address("AA:BB:CC:DD:EE:FF");
        let second = address("11:22:33:44:55:66");

        store
            .save(&first, &token("00112233445566778899aabbccddeeff"))
            .expect("first save should succeed");
        store
            .save(&second, &token("ffeeddccbbaa99887766554433221100"))
            .expect("second save should succeed");
        store
            .save(&first, &token("ab12ab12ab12ab12ab12ab1200000000"))
            .expect("overwrite should succeed");

        assert_eq!(
            Some(token("ab12ab12ab12ab12ab12ab1200000000")),
            store.load(&first).expect("first should load")
        );
        assert_eq!(
            Some(token("ffeeddccbbaa99887766554433221100")),
            store.load(&second).expect("second should load")
        );
    }

    #[test]
    fn save_preserves_unrelated_sections_and_comments() {
        let dir = TempDir::new().expect("tempdir should be created");
        let store = store_in(&dir);
        fs::create_dir_all(dir.path().join("nested")).expect("parent should be created");
        fs::write(
            store.path(),
            "# managed by hand\n[other]\nkey = value\n\n[tokens]\n; old devices\n112233445566 = ffeeddccbbaa99887766554433221100\n",
        )
        .expect("fixture should write");

        store
            .save(
                &address("aabbccddeeff"),
                &token("00112233445566778899aabbccddeeff"),
            )
            .expect("save should succeed");

        let contents = fs::read_to_string(store.path()).expect("store should be readable");
        assert_eq!(
            "# managed by hand\n[other]\nkey = value\n\n[tokens]\n; old devices\n112233445566 = ffeeddccbbaa99887766554433221100\naabbccddeeff = 00112233445566778899aabbccddeeff\n",
            contents
        );
    }

    #[rstest]
    #[case("[tokens]\nAA:BB:CC:DD:EE:FF = 00112233445566778899aabbccddeeff\n")]
    #[case("[TOKENS]\naabbccddeeff: 00112233445566778899aabbccddeeff\n")]
    fn load_accepts_legacy_key_and_delimiter_forms(#[case] contents: &str) {
        let dir = TempDir::new().expect("tempdir should be created");
        let store = TokenStore::new(dir.path().join(TOKENS_FILE_NAME));
        fs::write(store.path(), contents).expect("fixture should write");

        let loaded = store
            .load(&address("aabbccddeeff"))
            .expect("store should load");
        assert_eq!(Some(token("00112233445566778899aabbccddeeff")), loaded);
    }

    #[test]
    fn load_rejects_malformed_record() {
        let dir = TempDir::new().expect("tempdir should be created");
        let store = TokenStore::new(dir.path().join(TOKENS_FILE_NAME));
        fs::write(store.path(), "[tokens]\nnot a record\n").expect("fixture should write");

        let result = store.load(&address("aabbccddeeff"));
        assert_matches!(result, Err(TokenStoreError::InvalidRecord { line: 2 }));
    }

    #[test]
    fn load_rejects_malformed_token_value() {
        let dir = TempDir::new().expect("tempdir should be created");
        let store = TokenStore::new(dir.path().join(TOKENS_FILE_NAME));
        fs::write(store.path(), "[tokens]\naabbccddeeff = abcd\n").expect("fixture should write");

        let result = store.load(&address("aabbccddeeff"));
        assert_matches!(
            result,
            Err(TokenStoreError::InvalidToken {
                source: AuthTokenError::InvalidLength { actual: 2 },
                ..
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn save_restricts_permissions_to_owner() {
        use std::os::unix::fs::PermissionsExt as _;

        let dir = TempDir::new().expect("tempdir should be created");
        let store = store_in(&dir);
        store
            .save(
                &address("aabbccddeeff"),
                &token("00112233445566778899aabbccddeeff"),
            )
            .expect("save should succeed");

        let mode = fs::metadata(store.path())
            .expect("metadata should be readable")
            .permissions()
            .mode();
        assert_eq!(0o600, mode & 0o777);
    }

    #[test]
    fn token_debug_is_redacted() {
        let rendered = format!("{:?}", token("00112233445566778899aabbccddeeff"));
        assert_eq!("AuthToken(<redacted>)", rendered);
    }

    #[rstest]
    #[case("zz112233445566778899aabbccddeeff")]
    #[case("0011")]
    fn token_parse_rejects_invalid_input(#[case] raw: &str) {
        assert!(raw.parse::<AuthToken>().is_err());
    }
}
