//! Configuration loading and validation.
//!
//! The configuration is a single TOML file with a `[main]` and a `[mail]`
//! section, one `[groups.<name>]` table per source group and one
//! `[destinations.<name>]` table per notification destination. Everything is
//! validated at load time; nothing is started for an invalid configuration.

pub mod sources;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use lettre::message::Mailbox;
use serde::Deserialize;
use tracing::{debug, info};

use crate::notification::events::SourceMeta;
use crate::notification::queue::BatchQueueConfig;
use crate::{Error, Result};

pub use sources::SourceEntry;

/// Default sender identity.
pub const DEFAULT_FROM: &str = "\"Alarm Mailer\" <mailer@localhost>";

/// Default subject; `{count}` is replaced by the number of events.
pub const DEFAULT_SUBJECT: &str = "{count} Alarm Events";

fn default_initial_wait() -> f64 {
    1.0
}

fn default_server() -> String {
    "localhost".to_string()
}

fn default_timeout() -> f64 {
    15.0
}

fn default_proto() -> String {
    "ESMTP".to_string()
}

fn default_mail_delay() -> f64 {
    30.0
}

fn default_mail_holdoff() -> f64 {
    30.0
}

fn default_mail_queue_size() -> usize {
    10
}

fn default_from() -> String {
    DEFAULT_FROM.to_string()
}

fn default_subject() -> String {
    DEFAULT_SUBJECT.to_string()
}

fn default_dest_delay() -> f64 {
    300.0
}

fn default_dest_holdoff() -> f64 {
    600.0
}

fn default_dest_queue_size() -> usize {
    200
}

fn default_plain() -> String {
    "template.txt".to_string()
}

fn default_html() -> String {
    "template.html".to_string()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ConfigFile {
    #[serde(default)]
    main: MainSection,
    #[serde(default)]
    mail: MailSection,
    #[serde(default)]
    groups: BTreeMap<String, GroupSection>,
    #[serde(default)]
    destinations: BTreeMap<String, DestinationSection>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MainSection {
    #[serde(default = "default_initial_wait")]
    initial_wait: f64,
}

impl Default for MainSection {
    fn default() -> Self {
        Self {
            initial_wait: default_initial_wait(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MailSection {
    #[serde(default = "default_server")]
    server: String,
    #[serde(default)]
    port: Option<u16>,
    #[serde(default = "default_timeout")]
    timeout: f64,
    #[serde(default = "default_proto")]
    proto: String,
    #[serde(default)]
    nosend: bool,
    #[serde(default = "default_mail_delay")]
    delay: f64,
    #[serde(default = "default_mail_holdoff")]
    holdoff: f64,
    #[serde(default = "default_mail_queue_size")]
    queue_size: usize,
}

impl Default for MailSection {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: None,
            timeout: default_timeout(),
            proto: default_proto(),
            nosend: false,
            delay: default_mail_delay(),
            holdoff: default_mail_holdoff(),
            queue_size: default_mail_queue_size(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct GroupSection {
    #[serde(default)]
    sources: Option<Vec<String>>,
    #[serde(default)]
    sources_file: Option<PathBuf>,
    #[serde(default)]
    alarm_initial: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DestinationSection {
    #[serde(default)]
    to: Vec<String>,
    #[serde(default = "default_from")]
    from: String,
    #[serde(default = "default_subject")]
    subject: String,
    #[serde(default = "default_dest_delay")]
    delay: f64,
    #[serde(default = "default_dest_holdoff")]
    holdoff: f64,
    #[serde(default = "default_dest_queue_size")]
    queue_size: usize,
    #[serde(default)]
    groups: Vec<String>,
    #[serde(default = "default_plain")]
    plain: String,
    #[serde(default = "default_html")]
    html: String,
    #[serde(default)]
    send_initial: bool,
}

/// Process-level settings.
#[derive(Debug, Clone, PartialEq)]
pub struct MainConfig {
    /// How long to wait for sources to connect before reporting the silent ones.
    pub initial_wait: Duration,
}

/// Mail server settings and the transport queue parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct MailConfig {
    pub server: String,
    pub port: u16,
    pub timeout: Duration,
    /// Log rendered mails instead of sending them.
    pub nosend: bool,
    pub queue: BatchQueueConfig,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            port: 25,
            timeout: Duration::from_secs(15),
            nosend: false,
            queue: BatchQueueConfig::new(Duration::from_secs(30), Duration::from_secs(30), 10),
        }
    }
}

impl MailConfig {
    /// Read only the `[mail]` section of a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let file: ConfigFile = toml::from_str(&contents)?;
        build_mail(file.mail)
    }
}

/// A named set of sources.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupConfig {
    pub name: String,
    pub sources: Vec<String>,
    pub descriptions: HashMap<String, String>,
    /// Report alarms present in the first update of each source.
    pub alarm_initial: bool,
}

impl GroupConfig {
    pub fn from_entries(name: impl Into<String>, entries: Vec<SourceEntry>, alarm_initial: bool) -> Self {
        let mut sources = Vec::with_capacity(entries.len());
        let mut descriptions = HashMap::with_capacity(entries.len());
        for entry in entries {
            descriptions.insert(entry.name.clone(), entry.description);
            sources.push(entry.name);
        }
        Self {
            name: name.into(),
            sources,
            descriptions,
            alarm_initial,
        }
    }

    /// Metadata shared by the events of this group.
    pub fn meta(&self) -> Arc<SourceMeta> {
        Arc::new(SourceMeta {
            group: self.name.clone(),
            descriptions: self.descriptions.clone(),
        })
    }
}

/// A notification destination.
#[derive(Debug, Clone, PartialEq)]
pub struct DestinationConfig {
    pub name: String,
    pub to: Vec<String>,
    pub from: String,
    pub subject: String,
    pub queue: BatchQueueConfig,
    pub groups: Vec<String>,
    /// Template id of the plain text part.
    pub plain: String,
    /// Template id of the HTML part.
    pub html: String,
    /// Queue a startup notice as soon as the destination starts.
    pub send_initial: bool,
}

impl DestinationConfig {
    /// A destination with default settings.
    pub fn new(name: impl Into<String>, to: Vec<String>, groups: Vec<String>) -> Self {
        Self {
            name: name.into(),
            to,
            from: default_from(),
            subject: default_subject(),
            queue: BatchQueueConfig::new(
                Duration::from_secs(300),
                Duration::from_secs(600),
                default_dest_queue_size(),
            ),
            groups,
            plain: default_plain(),
            html: default_html(),
            send_initial: false,
        }
    }

    /// Subject line for a batch of `count` events.
    pub fn subject_for(&self, count: usize) -> String {
        self.subject.replace("{count}", &count.to_string())
    }

    pub fn validate(&self) -> Result<()> {
        if self.groups.is_empty() {
            return Err(Error::config(format!(
                "No source groups specified for destination {}",
                self.name
            )));
        }
        if self.to.is_empty() {
            return Err(Error::config(format!(
                "Destination {} has no recipient (to) list",
                self.name
            )));
        }
        for address in std::iter::once(&self.from).chain(&self.to) {
            address.parse::<Mailbox>().map_err(|e| {
                Error::config(format!(
                    "Destination {} has an invalid address '{}': {}",
                    self.name, address, e
                ))
            })?;
        }
        Ok(())
    }
}

/// The validated configuration.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub main: MainConfig,
    pub mail: MailConfig,
    pub groups: BTreeMap<String, Arc<GroupConfig>>,
    pub destinations: Vec<Arc<DestinationConfig>>,
}

impl AppConfig {
    /// Load and validate a configuration file.
    ///
    /// Relative `sources_file` paths are resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from {}", path.display());
        let contents = std::fs::read_to_string(path).map_err(|e| {
            Error::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_toml_str(&contents, base_dir)
    }

    /// Parse and validate configuration text.
    pub fn from_toml_str(contents: &str, base_dir: &Path) -> Result<Self> {
        let file: ConfigFile = toml::from_str(contents)?;

        let main = MainConfig {
            initial_wait: seconds("main.initial_wait", file.main.initial_wait)?,
        };
        let mail = build_mail(file.mail)?;

        let mut groups = BTreeMap::new();
        for (name, section) in file.groups {
            let group = build_group(&name, section, base_dir)?;
            debug!(group = %name, sources = group.sources.len(), "loaded source group");
            groups.insert(name, Arc::new(group));
        }

        let mut destinations = Vec::with_capacity(file.destinations.len());
        for (name, section) in file.destinations {
            destinations.push(Arc::new(build_destination(&name, section)?));
        }

        if groups.is_empty() {
            return Err(Error::config("No source groups"));
        }
        if destinations.is_empty() {
            return Err(Error::config("No destinations"));
        }

        for dest in &destinations {
            for group in &dest.groups {
                if !groups.contains_key(group) {
                    return Err(Error::config(format!(
                        "Destination {} references source group {} which does not exist",
                        dest.name, group
                    )));
                }
            }
        }

        Ok(Self {
            main,
            mail,
            groups,
            destinations,
        })
    }

    /// Total number of monitored sources across all groups.
    pub fn source_count(&self) -> usize {
        self.groups.values().map(|g| g.sources.len()).sum()
    }
}

/// Convert a duration given in seconds, rejecting negative and non-finite values.
fn seconds(field: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value < 0.0 {
        return Err(Error::validation(format!(
            "{} must be a non-negative number of seconds, got {}",
            field, value
        )));
    }
    Duration::try_from_secs_f64(value)
        .map_err(|e| Error::validation(format!("{} = {} is out of range: {}", field, value, e)))
}

fn build_mail(section: MailSection) -> Result<MailConfig> {
    if section.proto != "ESMTP" {
        return Err(Error::config(format!(
            "mail protocol {} not supported",
            section.proto
        )));
    }
    Ok(MailConfig {
        server: section.server,
        port: section.port.unwrap_or(25),
        timeout: seconds("mail.timeout", section.timeout)?,
        nosend: section.nosend,
        queue: BatchQueueConfig::new(
            seconds("mail.delay", section.delay)?,
            seconds("mail.holdoff", section.holdoff)?,
            section.queue_size,
        ),
    })
}

fn build_group(name: &str, section: GroupSection, base_dir: &Path) -> Result<GroupConfig> {
    let entries = match (section.sources, section.sources_file) {
        (Some(inline), _) => inline
            .iter()
            .filter_map(|line| sources::parse_entry(line))
            .collect(),
        (None, Some(file)) => sources::read_list(&base_dir.join(file))?,
        (None, None) => {
            return Err(Error::config(format!(
                "No source list found for group {}",
                name
            )));
        }
    };

    if entries.is_empty() {
        return Err(Error::config(format!("Empty source list for group {}", name)));
    }

    Ok(GroupConfig::from_entries(name, entries, section.alarm_initial))
}

fn build_destination(name: &str, section: DestinationSection) -> Result<DestinationConfig> {
    let to: Vec<String> = section
        .to
        .iter()
        .map(|addr| addr.trim().to_string())
        .filter(|addr| !addr.is_empty())
        .collect();
    let groups: Vec<String> = section
        .groups
        .iter()
        .map(|g| g.trim().to_string())
        .filter(|g| !g.is_empty())
        .collect();

    let prefix = format!("destinations.{}", name);
    let dest = DestinationConfig {
        name: name.to_string(),
        to,
        from: section.from,
        subject: section.subject,
        queue: BatchQueueConfig::new(
            seconds(&format!("{}.delay", prefix), section.delay)?,
            seconds(&format!("{}.holdoff", prefix), section.holdoff)?,
            section.queue_size,
        ),
        groups,
        plain: section.plain,
        html: section.html,
        send_initial: section.send_initial,
    };
    dest.validate()?;
    Ok(dest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const MINIMAL: &str = r#"
[groups.vacuum]
sources = ["VAC:1 | Sector 1 gauge", "VAC:2"]

[destinations.ops]
to = ["ops@example.org"]
groups = ["vacuum"]
"#;

    fn parse(contents: &str) -> Result<AppConfig> {
        AppConfig::from_toml_str(contents, Path::new("."))
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.main.initial_wait, Duration::from_secs(1));
        assert_eq!(config.mail.server, "localhost");
        assert_eq!(config.mail.port, 25);
        assert!(!config.mail.nosend);
        assert_eq!(config.mail.queue.queue_size, 10);

        let dest = &config.destinations[0];
        assert_eq!(dest.from, DEFAULT_FROM);
        assert_eq!(dest.queue.delay, Duration::from_secs(300));
        assert_eq!(dest.queue.holdoff, Duration::from_secs(600));
        assert_eq!(dest.queue.queue_size, 200);
        assert_eq!(dest.plain, "template.txt");
        assert!(!dest.send_initial);

        let group = &config.groups["vacuum"];
        assert_eq!(group.sources, vec!["VAC:1", "VAC:2"]);
        assert_eq!(group.descriptions["VAC:1"], "Sector 1 gauge");
        assert_eq!(group.descriptions["VAC:2"], "VAC:2");
        assert_eq!(config.source_count(), 2);
    }

    #[test]
    fn test_subject_formatting() {
        let config = parse(MINIMAL).unwrap();
        assert_eq!(config.destinations[0].subject_for(3), "3 Alarm Events");
    }

    #[test]
    fn test_destination_without_groups_rejected() {
        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = ["ops@example.org"]
groups = []
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("No source groups specified"));
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_destination_without_recipients_rejected() {
        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = [" "]
groups = ["vacuum"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("no recipient"));
    }

    #[test]
    fn test_unknown_group_reference_rejected() {
        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = ["ops@example.org"]
groups = ["vacuum", "cryo"]
"#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cryo"));
    }

    #[test]
    fn test_missing_sections_rejected() {
        assert!(parse("").unwrap_err().to_string().contains("No source groups"));
        assert!(
            parse("[groups.vacuum]\nsources = [\"VAC:1\"]\n")
                .unwrap_err()
                .to_string()
                .contains("No destinations")
        );
    }

    #[test]
    fn test_group_without_sources_rejected() {
        let err = parse("[groups.vacuum]\nalarm_initial = true\n").unwrap_err();
        assert!(err.to_string().contains("No source list"));

        let err = parse("[groups.vacuum]\nsources = [\"# only a comment\"]\n").unwrap_err();
        assert!(err.to_string().contains("Empty source list"));
    }

    #[test]
    fn test_negative_delay_rejected() {
        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = ["ops@example.org"]
groups = ["vacuum"]
delay = -1.0
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_huge_delay_rejected() {
        let contents = format!("[main]\ninitial_wait = 1e30\n{}", MINIMAL);
        let err = parse(&contents).unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("initial_wait")));
        assert!(err.is_fatal_at_startup());

        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = ["ops@example.org"]
groups = ["vacuum"]
holdoff = 1e300
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Validation(ref msg) if msg.contains("destinations.ops.holdoff")));
    }

    #[test]
    fn test_invalid_address_rejected() {
        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = ["ops@example.org", "not an address"]
groups = ["vacuum"]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, Error::Configuration(ref msg) if msg.contains("not an address")));

        let err = parse(
            r#"
[groups.vacuum]
sources = ["VAC:1"]

[destinations.ops]
to = ["ops@example.org"]
from = "Alarm Mailer <"
groups = ["vacuum"]
"#,
        )
        .unwrap_err();
        assert!(err.is_fatal_at_startup());
    }

    #[test]
    fn test_unsupported_protocol_rejected() {
        let contents = format!("[mail]\nproto = \"LMTP\"\n{}", MINIMAL);
        let err = parse(&contents).unwrap_err();
        assert!(err.to_string().contains("LMTP"));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let contents = format!("[main]\nintial_wait = 2.0\n{}", MINIMAL);
        assert!(matches!(parse(&contents).unwrap_err(), Error::Toml(_)));
    }

    #[test]
    fn test_mail_section_only() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mail.toml");
        std::fs::write(&path, "[mail]\nserver = \"smtp.example.org\"\nholdoff = 5\n").unwrap();

        let mail = MailConfig::load(&path).unwrap();
        assert_eq!(mail.server, "smtp.example.org");
        assert_eq!(mail.queue.holdoff, Duration::from_secs(5));
        assert_eq!(mail.queue.delay, Duration::from_secs(30));
    }

    #[test]
    fn test_sources_file_relative_to_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut list = std::fs::File::create(dir.path().join("vacuum.list")).unwrap();
        writeln!(list, "VAC:1 | Gauge one").unwrap();
        writeln!(list, "# spare").unwrap();
        writeln!(list, "VAC:3").unwrap();

        let config_path = dir.path().join("mailer.toml");
        std::fs::write(
            &config_path,
            r#"
[main]
initial_wait = 0.5

[mail]
nosend = true
port = 2525

[groups.vacuum]
sources_file = "vacuum.list"
alarm_initial = true

[destinations.ops]
to = ["ops@example.org", "oncall@example.org"]
groups = ["vacuum"]
send_initial = true
delay = 10
holdoff = 20
queue_size = 5
"#,
        )
        .unwrap();

        let config = AppConfig::load(&config_path).unwrap();
        assert_eq!(config.main.initial_wait, Duration::from_millis(500));
        assert!(config.mail.nosend);
        assert_eq!(config.mail.port, 2525);

        let group = &config.groups["vacuum"];
        assert!(group.alarm_initial);
        assert_eq!(group.sources, vec!["VAC:1", "VAC:3"]);

        let dest = &config.destinations[0];
        assert_eq!(dest.to.len(), 2);
        assert!(dest.send_initial);
        assert_eq!(
            dest.queue,
            BatchQueueConfig::new(Duration::from_secs(10), Duration::from_secs(20), 5)
        );
    }
}
