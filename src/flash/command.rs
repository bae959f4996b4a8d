//! Flashing tool command line

use std::path::Path;

use crate::config;
use crate::utils::Platform;

/// Fill `%s` placeholders left to right; missing values leave the rest as-is
pub fn substitute(template: &str, values: &[&str]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut values = values.iter();
    let mut rest = template;

    while let Some(index) = rest.find("%s") {
        let Some(value) = values.next() else {
            break;
        };
        out.push_str(&rest[..index]);
        out.push_str(value);
        rest = &rest[index + 2..];
    }

    out.push_str(rest);
    out
}

/// `"<tools dir>/bossac" <params>` for the given device and firmware image
pub fn build_command(
    platform: Platform,
    resources_dir: &Path,
    template: &str,
    device: &str,
    firmware: &Path,
) -> String {
    let tool = platform
        .tools_dir(resources_dir)
        .join(config::flash::TOOL_NAME);
    let firmware = firmware.to_string_lossy();
    let params = substitute(template, &[platform.short_device_name(device), &firmware]);
    format!("\"{}\" {}", tool.display(), params)
}
