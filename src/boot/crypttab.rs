use std::fmt::Display;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrypttabEntry {
    pub name: String,
    /// Source device, e.g. `PARTUUID=6c586e13-02`.
    pub device: String,
    pub key: String,
    pub options: Vec<String>,
}

impl CrypttabEntry {
    pub fn root(name: &str, device: &str, key: &str, keyscript: &str) -> Self {
        Self {
            name: name.to_owned(),
            device: device.to_owned(),
            key: key.to_owned(),
            options: vec![
                "luks".to_owned(),
                "discard".to_owned(),
                "initramfs".to_owned(),
                format!("keyscript={keyscript}"),
            ],
        }
    }
}

impl Display for CrypttabEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} {}",
            self.name,
            self.device,
            self.key,
            self.options.join(",")
        )
    }
}

/// Insert `entry`, replacing any entry with the same name. Other entries and
/// comments are kept in place.
pub fn upsert(content: &str, entry: &CrypttabEntry) -> String {
    let mut replaced = false;
    let mut lines = vec![];
    for line in content.lines() {
        let trimmed = line.trim_start();
        let name = trimmed.split_whitespace().next();
        if !trimmed.starts_with('#') && name == Some(entry.name.as_str()) {
            if !replaced {
                lines.push(entry.to_string());
                replaced = true;
            }
            continue;
        }
        lines.push(line.to_owned());
    }
    if !replaced {
        lines.push(entry.to_string());
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}

#[cfg(test)]
pub mod tests {

    use super::*;

    fn entry() -> CrypttabEntry {
        CrypttabEntry::root(
            "cryptroot",
            "PARTUUID=6c586e13-02",
            "0f2d.lek",
            "/usr/lib/imgcrypt/unlock-key",
        )
    }

    #[test]
    fn test_render_entry() {
        assert_eq!(
            entry().to_string(),
            "cryptroot PARTUUID=6c586e13-02 0f2d.lek luks,discard,initramfs,keyscript=/usr/lib/imgcrypt/unlock-key"
        );
    }

    #[test]
    fn test_upsert_into_default_table() {
        let out = upsert("# <target name>\t<source device>\t\t<key file>\t<options>\n", &entry());
        assert_eq!(
            out,
            format!("# <target name>\t<source device>\t\t<key file>\t<options>\n{}\n", entry())
        );
    }

    #[test]
    fn test_upsert_replaces_same_name_only() {
        let table = "\
cryptroot /dev/mmcblk0p2 none luks
# cryptroot commented out stays
data UUID=1234 /etc/keys/data.key luks
cryptroot /dev/sda2 none luks
";
        let out = upsert(table, &entry());
        let lines: Vec<_> = out.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], entry().to_string());
        assert_eq!(lines[1], "# cryptroot commented out stays");
        assert_eq!(lines[2], "data UUID=1234 /etc/keys/data.key luks");
    }

    #[test]
    fn test_upsert_empty() {
        assert_eq!(upsert("", &entry()), format!("{}\n", entry()));
    }
}
