// User identity handling
//
// An identity is three uppercase letters, a dash and three digits ("ABC-123").
// It is generated once and kept in the config directory.

use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use log::{info, warn};
use rand::Rng;

const IDENTITY_FILE: &str = "user_id";

pub trait IdentityProvider: Send + Sync {
    fn user_id(&self) -> String;
}

/// Generate a random identity such as `QFT-042`.
pub fn generate_user_id() -> String {
    let mut rng = rand::thread_rng();
    let letters: String = (0..3).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect();
    let digits: String = (0..3).map(|_| char::from(b'0' + rng.gen_range(0..10u8))).collect();
    format!("{}-{}", letters, digits)
}

pub fn is_valid_user_id(id: &str) -> bool {
    let bytes = id.as_bytes();
    bytes.len() == 7
        && bytes[..3].iter().all(|b| b.is_ascii_uppercase())
        && bytes[3] == b'-'
        && bytes[4..].iter().all(|b| b.is_ascii_digit())
}

/// A fixed identity, e.g. given on the command line.
#[derive(Debug, Clone)]
pub struct StaticIdentity(String);

impl StaticIdentity {
    pub fn new(user_id: &str) -> Result<Self> {
        if !is_valid_user_id(user_id) {
            return Err(anyhow!("'{}' is not a valid user id (expected e.g. ABC-123)", user_id));
        }
        Ok(StaticIdentity(user_id.to_string()))
    }
}

impl IdentityProvider for StaticIdentity {
    fn user_id(&self) -> String {
        self.0.clone()
    }
}

/// Identity persisted in a file, generated on first use.
#[derive(Debug, Clone)]
pub struct FileIdentity {
    user_id: String,
    path: PathBuf,
}

impl FileIdentity {
    /// Load the identity stored in `dir`, or generate and store a new one.
    ///
    /// # Returns
    ///
    /// The identity and whether it was newly generated
    pub fn load_or_create(dir: &Path) -> Result<(Self, bool)> {
        let path = dir.join(IDENTITY_FILE);
        if let Some(user_id) = read_identity(&path) {
            return Ok((FileIdentity { user_id, path }, false));
        }

        if !dir.exists() {
            fs::create_dir_all(dir)?;
        }
        let user_id = generate_user_id();
        let mut file = fs::File::create(&path)?;
        write!(file, "{}", user_id)?;
        info!("Generated new user id {} and saved it to {}", user_id, path.display());
        Ok((FileIdentity { user_id, path }, true))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityProvider for FileIdentity {
    fn user_id(&self) -> String {
        self.user_id.clone()
    }
}

fn read_identity(path: &Path) -> Option<String> {
    if !path.exists() {
        return None;
    }
    let mut content = String::new();
    if let Err(e) = fs::File::open(path).and_then(|mut f| f.read_to_string(&mut content)) {
        warn!("Error reading identity file {}: {}", path.display(), e);
        return None;
    }
    let id = content.trim();
    if is_valid_user_id(id) {
        Some(id.to_string())
    } else {
        warn!("Identity file {} holds an invalid id, generating a new one", path.display());
        None
    }
}
