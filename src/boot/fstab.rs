use crate::types::MakeFsType;

/// Point the `/` entry of an fstab at `device`, switching its filesystem type
/// to `fs_type`. A table without a root entry gets one appended.
pub fn rewrite_root_entry(content: &str, device: &str, fs_type: MakeFsType) -> String {
    let fs_name = fs_type.to_string();
    let mut found = false;
    let mut lines: Vec<String> = content
        .lines()
        .map(|line| {
            let trimmed = line.trim_start();
            if trimmed.starts_with('#') {
                return line.to_owned();
            }
            let mut fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() < 2 || fields[1] != "/" {
                return line.to_owned();
            }
            found = true;

            fields[0] = device;
            if fields.len() > 2 {
                fields[2] = &fs_name;
            }
            fields.join("  ")
        })
        .collect();

    if !found {
        lines.push(format!("{device}  /  {fs_name}  defaults,noatime  0  1"));
    }

    let mut out = lines.join("\n");
    out.push('\n');
    out
}
