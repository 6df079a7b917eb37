//! One-time secret material.
//!
//! Secrets are generated once per stack, during the plan pass, and shared by
//! reference with every consumer. Generators that leave something behind,
//! such as a key file, clean it up when the stack is destroyed.
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::process::Command as Process;
use std::sync::Arc;

use anyhow::{Context, bail};
use camino::{Utf8Path, Utf8PathBuf};
use uuid::Uuid;

use crate::core::{ArcStr, Kind, hex};
use crate::error::StackError;
use crate::value::Value;

/// Generated credential data.
///
/// The plaintext is only reachable via [`SecretMaterial::expose`], neither
/// `Debug` nor `Display` print it. Clones share the same allocation.
#[derive(Clone)]
pub struct SecretMaterial {
    name: ArcStr,
    data: Arc<str>,
    file: Option<Utf8PathBuf>,
}

impl SecretMaterial {
    pub fn new(data: impl Into<String>) -> Self {
        Self {
            name: "".into(),
            data: data.into().into(),
            file: None,
        }
    }

    /// Records a file that holds this material and has to be removed on
    /// teardown.
    pub fn with_file(mut self, path: impl Into<Utf8PathBuf>) -> Self {
        self.file = Some(path.into());
        self
    }

    pub(crate) fn named(mut self, name: ArcStr) -> Self {
        self.name = name;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn expose(&self) -> &str {
        &self.data
    }

    pub fn file(&self) -> Option<&Utf8Path> {
        self.file.as_deref()
    }

    /// Whether both materials are the very same generated data.
    pub fn same_as(&self, other: &SecretMaterial) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }
}

impl PartialEq for SecretMaterial {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl fmt::Debug for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretMaterial")
            .field("name", &self.name)
            .field("data", &"[secret]")
            .field("file", &self.file)
            .finish()
    }
}

impl fmt::Display for SecretMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[secret {}]", self.name)
    }
}

/// Produces secret material.
///
/// Any `Fn(&str) -> anyhow::Result<SecretMaterial>` closure is a generator;
/// it receives the secret's logical name.
pub trait Generator: Send + Sync {
    fn generate(&self, name: &str) -> anyhow::Result<SecretMaterial>;

    /// Releases whatever [`Generator::generate`] left behind.
    fn destroy(&self, _material: &SecretMaterial) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<F> Generator for F
where
    F: Fn(&str) -> anyhow::Result<SecretMaterial> + Send + Sync,
{
    fn generate(&self, name: &str) -> anyhow::Result<SecretMaterial> {
        self(name)
    }
}

/// Random bytes from the operating system, hex encoded.
#[derive(Debug, Clone, Copy)]
pub struct RandomHex {
    bytes: usize,
}

impl RandomHex {
    pub fn new(bytes: usize) -> Self {
        Self { bytes }
    }
}

impl Generator for RandomHex {
    fn generate(&self, _: &str) -> anyhow::Result<SecretMaterial> {
        let mut buffer = vec![0u8; self.bytes];
        entropy(&mut buffer)?;
        Ok(SecretMaterial::new(hex(&buffer)))
    }
}

fn entropy(buffer: &mut [u8]) -> anyhow::Result<()> {
    getrandom::fill(buffer).map_err(|e| anyhow::anyhow!("no system entropy: {e}"))
}

/// Uniform index below `bound`, which must not be zero.
fn random_index(bound: usize) -> anyhow::Result<usize> {
    let mut bytes = [0u8; 8];
    let zone = u64::MAX - u64::MAX % bound as u64;

    loop {
        entropy(&mut bytes)?;
        let value = u64::from_le_bytes(bytes);
        if value < zone {
            return Ok((value % bound as u64) as usize);
        }
    }
}

/// A random version 4 UUID.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomUuid;

impl Generator for RandomUuid {
    fn generate(&self, _: &str) -> anyhow::Result<SecretMaterial> {
        Ok(SecretMaterial::new(Uuid::new_v4().to_string()))
    }
}

const ADJECTIVES: &[&str] = &[
    "able", "brave", "calm", "clever", "cosmic", "eager", "fancy", "gentle", "happy", "humble",
    "jolly", "keen", "lively", "lucky", "mellow", "modest", "noble", "polite", "proud", "quiet",
    "rapid", "sharp", "steady", "sunny", "swift", "tender", "upbeat", "vivid", "witty", "zesty",
];

const PETS: &[&str] = &[
    "badger", "beagle", "bison", "crane", "dingo", "egret", "falcon", "ferret", "gecko", "heron",
    "ibex", "jackal", "koala", "lemur", "lynx", "marmot", "moose", "narwhal", "ocelot", "otter",
    "panda", "puffin", "quail", "raven", "salmon", "tapir", "urchin", "walrus", "yak", "zebra",
];

/// A random, human readable name such as `brave-otter`, for naming servers
/// and the like.
///
/// The name is made of `length` words: adjectives followed by one animal.
#[derive(Debug, Clone)]
pub struct RandomPet {
    length: usize,
    separator: String,
    prefix: Option<String>,
}

impl RandomPet {
    pub fn new() -> Self {
        Self {
            length: 2,
            separator: "-".into(),
            prefix: None,
        }
    }

    pub fn length(mut self, length: usize) -> Self {
        self.length = length;
        self
    }

    pub fn separator(mut self, separator: impl Into<String>) -> Self {
        self.separator = separator.into();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

impl Default for RandomPet {
    fn default() -> Self {
        Self::new()
    }
}

impl Generator for RandomPet {
    fn generate(&self, _: &str) -> anyhow::Result<SecretMaterial> {
        if self.length == 0 {
            bail!("a pet name needs at least one word");
        }

        let mut words = Vec::with_capacity(self.length + 1);
        words.extend(self.prefix.clone());
        for _ in 1..self.length {
            words.push(ADJECTIVES[random_index(ADJECTIVES.len())?].to_string());
        }
        words.push(PETS[random_index(PETS.len())?].to_string());

        Ok(SecretMaterial::new(words.join(self.separator.as_str())))
    }
}

/// Picks `count` distinct entries of `inputs` in random order. The material
/// is the picked entries joined with commas.
#[derive(Debug, Clone)]
pub struct RandomShuffle {
    inputs: Vec<String>,
    count: Option<usize>,
}

impl RandomShuffle {
    pub fn new<I, S>(inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            count: None,
        }
    }

    /// Number of entries to keep, all of them by default.
    pub fn result_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    fn shuffle(&self) -> anyhow::Result<Vec<String>> {
        let count = self.count.unwrap_or(self.inputs.len());
        if count > self.inputs.len() {
            bail!(
                "cannot pick {count} out of {} inputs",
                self.inputs.len()
            );
        }

        let mut items = self.inputs.clone();
        for i in 0..count {
            let j = i + random_index(items.len() - i)?;
            items.swap(i, j);
        }
        items.truncate(count);

        Ok(items)
    }
}

impl Generator for RandomShuffle {
    fn generate(&self, _: &str) -> anyhow::Result<SecretMaterial> {
        Ok(SecretMaterial::new(self.shuffle()?.join(",")))
    }
}

/// Runs a shell command, its trimmed standard output is the material.
///
/// An optional delete command runs on teardown, e.g. to remove key files
/// written by the create command.
///
/// ```rust
/// use kumiki::Command;
///
/// let vapid = Command::new(
///     "openssl ecparam -name prime256v1 -genkey -noout -out vapid_private_key.pem \
///      && sed -e '1 d' -e '$ d' vapid_private_key.pem | tr -d '\\n'",
/// )
/// .delete("rm vapid_private_key.pem");
/// ```
#[derive(Debug, Clone)]
pub struct Command {
    create: String,
    delete: Option<String>,
    dir: Option<Utf8PathBuf>,
}

impl Command {
    pub fn new(create: impl Into<String>) -> Self {
        Self {
            create: create.into(),
            delete: None,
            dir: None,
        }
    }

    pub fn delete(mut self, delete: impl Into<String>) -> Self {
        self.delete = Some(delete.into());
        self
    }

    pub fn current_dir(mut self, dir: impl Into<Utf8PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    fn run(&self, script: &str) -> anyhow::Result<String> {
        let mut process = Process::new("sh");
        process.arg("-c").arg(script);

        if let Some(dir) = &self.dir {
            process.current_dir(dir);
        }

        let output = process
            .output()
            .with_context(|| format!("failed to spawn `sh -c {script}`"))?;

        if !output.status.success() {
            bail!(
                "command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let stdout = String::from_utf8(output.stdout).context("command output is not UTF-8")?;
        Ok(stdout.trim().to_string())
    }
}

impl Generator for Command {
    fn generate(&self, _: &str) -> anyhow::Result<SecretMaterial> {
        let data = self.run(&self.create)?;
        if data.is_empty() {
            bail!("command produced no output");
        }
        Ok(SecretMaterial::new(data))
    }

    fn destroy(&self, _: &SecretMaterial) -> anyhow::Result<()> {
        match &self.delete {
            Some(delete) => self.run(delete).map(drop),
            None => Ok(()),
        }
    }
}

/// Persists the material of another generator to `<dir>/<name>.key`. The
/// file is removed on teardown.
#[derive(Debug, Clone)]
pub struct KeyFile<G> {
    dir: Utf8PathBuf,
    inner: G,
}

impl<G: Generator> KeyFile<G> {
    pub fn new(dir: impl Into<Utf8PathBuf>, inner: G) -> Self {
        Self {
            dir: dir.into(),
            inner,
        }
    }
}

impl<G: Generator> Generator for KeyFile<G> {
    fn generate(&self, name: &str) -> anyhow::Result<SecretMaterial> {
        let material = self.inner.generate(name)?;
        let path = self.dir.join(format!("{name}.key"));

        fs::create_dir_all(&self.dir).with_context(|| format!("creating {}", self.dir))?;
        fs::write(&path, material.expose()).with_context(|| format!("writing {path}"))?;

        Ok(material.with_file(path))
    }

    fn destroy(&self, material: &SecretMaterial) -> anyhow::Result<()> {
        self.inner.destroy(material)?;

        if let Some(path) = material.file()
            && path.exists()
        {
            fs::remove_file(path).with_context(|| format!("removing {path}"))?;
        }

        Ok(())
    }
}

/// A secret registered in a stack.
pub(crate) struct SecretEntry {
    name: ArcStr,
    generator: Arc<dyn Generator>,
    material: Value<SecretMaterial>,
}

impl SecretEntry {
    pub fn new(name: ArcStr, generator: Arc<dyn Generator>, material: Value<SecretMaterial>) -> Self {
        Self {
            name,
            generator,
            material,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn material(&self) -> &Value<SecretMaterial> {
        &self.material
    }

    /// Runs the generator. Called exactly once, by the executor.
    pub fn generate(&self) -> Result<SecretMaterial, StackError> {
        self.generator
            .generate(&self.name)
            .map(|material| material.named(self.name.clone()))
            .map_err(|error| StackError::GenerationFailure {
                name: self.name.clone(),
                error,
            })
    }
}

/// Remembers every secret of a stack by name.
#[derive(Default)]
pub(crate) struct SecretManager {
    entries: BTreeMap<ArcStr, Arc<SecretEntry>>,
}

impl SecretManager {
    pub fn get(&self, name: &str) -> Option<&Arc<SecretEntry>> {
        self.entries.get(name)
    }

    pub fn insert(&mut self, entry: Arc<SecretEntry>) {
        self.entries.insert(entry.name.clone(), entry);
    }

    /// Releases side effects of a generated secret. Secrets that were never
    /// generated have nothing to release.
    pub fn destroy(&self, name: &str) -> Result<(), StackError> {
        let Some(entry) = self.entries.get(name) else {
            return Ok(());
        };

        let Some(Ok(material)) = entry.material.get() else {
            return Ok(());
        };

        tracing::debug!(secret = name, "releasing secret");
        entry
            .generator
            .destroy(&material)
            .map_err(|error| StackError::DestroyFailure {
                name: entry.name.clone(),
                kind: Kind::Secret,
                error,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_hex_has_requested_length() {
        let material = RandomHex::new(64).generate("otp").unwrap();
        assert_eq!(material.expose().len(), 128);
        assert!(material.expose().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn random_hex_differs_between_calls() {
        let a = RandomHex::new(32).generate("a").unwrap();
        let b = RandomHex::new(32).generate("b").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn uuid_is_version_four() {
        let uuid = RandomUuid.generate("id").unwrap();
        let parsed = Uuid::parse_str(uuid.expose()).unwrap();

        assert_eq!(parsed.get_version_num(), 4);
    }

    #[test]
    fn pet_names_have_requested_words() {
        let name = RandomPet::new().generate("server").unwrap();
        let words: Vec<_> = name.expose().split('-').collect();
        assert_eq!(words.len(), 2);
        assert!(ADJECTIVES.contains(&words[0]));
        assert!(PETS.contains(&words[1]));

        let name = RandomPet::new()
            .length(3)
            .separator("_")
            .prefix("web")
            .generate("server")
            .unwrap();
        let words: Vec<_> = name.expose().split('_').collect();
        assert_eq!(words.len(), 4);
        assert_eq!(words[0], "web");
        assert!(PETS.contains(&words[3]));
    }

    #[test]
    fn empty_pet_name_is_rejected() {
        assert!(RandomPet::new().length(0).generate("server").is_err());
    }

    #[test]
    fn shuffle_picks_distinct_inputs() {
        let sizes = [
            "Standard_DS12-1_v2",
            "Standard_DS3_v2_Promo",
            "Standard_D4_v3",
            "Standard_E8d_v4",
        ];
        let generator = RandomShuffle::new(sizes).result_count(2);

        for _ in 0..20 {
            let picked = generator.shuffle().unwrap();
            assert_eq!(picked.len(), 2);
            assert_ne!(picked[0], picked[1]);
            assert!(picked.iter().all(|size| sizes.contains(&size.as_str())));
        }

        let all = RandomShuffle::new(sizes).generate("vm-size").unwrap();
        let mut all: Vec<_> = all.expose().split(',').collect();
        all.sort();
        let mut expected = sizes.to_vec();
        expected.sort();
        assert_eq!(all, expected);
    }

    #[test]
    fn shuffle_cannot_pick_more_than_it_has() {
        let err = RandomShuffle::new(["a", "b"]).result_count(3).generate("x").unwrap_err();
        assert!(err.to_string().contains("3 out of 2"));
    }

    #[test]
    fn material_is_redacted() {
        let material = SecretMaterial::new("hunter2").named("password".into());
        let debug = format!("{material:?}");

        assert!(!debug.contains("hunter2"));
        assert_eq!(material.to_string(), "[secret password]");
    }

    #[test]
    fn closures_are_generators() {
        let generator =
            |name: &str| -> anyhow::Result<SecretMaterial> { Ok(SecretMaterial::new(format!("{name}-value"))) };
        assert_eq!(generator.generate("token").unwrap().expose(), "token-value");
    }

    #[test]
    fn command_captures_trimmed_stdout() {
        let material = Command::new("echo '  abc  '").generate("x").unwrap();
        assert_eq!(material.expose(), "abc");
    }

    #[test]
    fn command_failure_is_reported() {
        let err = Command::new("echo nope >&2; exit 3").generate("x").unwrap_err();
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn command_delete_runs_on_destroy() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let generator = Command::new("echo key > key.pem && cat key.pem")
            .delete("rm key.pem")
            .current_dir(&dir);

        let material = generator.generate("key").unwrap();
        assert_eq!(material.expose(), "key");
        assert!(dir.join("key.pem").exists());

        generator.destroy(&material).unwrap();
        assert!(!dir.join("key.pem").exists());
    }

    #[test]
    fn key_file_is_written_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let dir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();

        let generator = KeyFile::new(&dir, RandomHex::new(16));
        let material = generator.generate("vapid").unwrap();
        let path = material.file().unwrap().to_owned();

        assert_eq!(path, dir.join("vapid.key"));
        assert_eq!(fs::read_to_string(&path).unwrap(), material.expose());

        generator.destroy(&material).unwrap();
        assert!(!path.exists());
    }
}
