//! Raspberry Pi firmware `config.txt`.

/// Drop any `initramfs`/`auto_initramfs` directive and load `artifact` for
/// the kernel that follows. The directive goes into an `[all]` section so a
/// trailing model filter such as `[pi4]` does not swallow it.
pub fn set_initramfs(content: &str, artifact: &str) -> String {
    let mut lines: Vec<&str> = content
        .lines()
        .filter(|line| {
            let directive = line.trim_start();
            !(directive.starts_with("initramfs ") || directive.starts_with("auto_initramfs"))
        })
        .collect();

    while lines.last().is_some_and(|line| line.trim().is_empty()) {
        lines.pop();
    }

    let last_section = lines
        .iter()
        .rev()
        .map(|line| line.trim())
        .find(|line| line.starts_with('['));

    let mut out = lines.join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    if last_section.is_some_and(|section| section != "[all]") {
        out.push_str("\n[all]\n");
    }
    out.push_str(&format!("initramfs {artifact} followkernel\n"));
    out
}

#[cfg(test)]
pub mod tests {

    use super::*;

    #[test]
    fn test_set_initramfs_replaces_directives() {
        let config = "\
dtparam=audio=on
auto_initramfs=1
initramfs initrd.img-6.1.0 followkernel
# initramfs kept-as-comment
[all]
arm_64bit=1
";
        assert_eq!(
            set_initramfs(config, "initrd.img-6.6.51+rpt-rpi-v8"),
            "\
dtparam=audio=on
# initramfs kept-as-comment
[all]
arm_64bit=1
initramfs initrd.img-6.6.51+rpt-rpi-v8 followkernel
"
        );
    }

    #[test]
    fn test_set_initramfs_after_model_filter() {
        let config = "[pi4]\narm_boost=1\n\n";
        assert_eq!(
            set_initramfs(config, "initrd.img-6.6"),
            "[pi4]\narm_boost=1\n\n[all]\ninitramfs initrd.img-6.6 followkernel\n"
        );
    }

    #[test]
    fn test_set_initramfs_empty() {
        assert_eq!(set_initramfs("", "initrd"), "initramfs initrd followkernel\n");
    }
}
