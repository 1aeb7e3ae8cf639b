//! `playscrape init`: starter action file and hook script.

use anyhow::{bail, Result};
use std::path::{Path, PathBuf};

fn action_template(name: &str) -> String {
    format!(
        r#"# playscrape action file: {name}
#
#   playscrape scrape {name}.toml --dry-run
#   playscrape test {name}.toml
#   playscrape export {name}.toml

[options]
source = "{name}"
script = "{name}.lua"
# format = "jpg"          # jpg | png | webp | gif | bmp | original
# delay_ms = 1000
# timeout_ms = 60000
# output_dir = "output"

# Mirrored HTML files under `root`.
[mirror]
root = "mirror"
html_files = "**/*.html"
base_url = "https://example.com/"
extract = {{ lua = "extract_page" }}
images = {{ lua = "page_images" }}

# Browser mode, instead of [mirror]:
#
# [browser.start]
# init = "https://example.com/items"
# visit_all = {{ links = "a.item", action = "item" }}
# next = {{ click = "a.next" }}
#
# [browser.item]
# extract = {{ fields = {{ title = "h1", image = "img.main@src" }} }}
# images = {{ selector = "img.main@src" }}
# test_urls = ["https://example.com/items/1"]
"#
    )
}

fn script_template(name: &str) -> String {
    format!(
        r#"--[[
  playscrape hooks: {name}

  Referenced from {name}.toml as {{ lua = "<function>" }}.
  page = {{ url, content, dom }}; dom offers query_text, query_all_text,
  query_attr, query_all_attr, query_html, query_all_html and count.
]]

scraper = {{}}

--- Return a record table, an array of record tables, or nil.
function scraper.extract_page(page)
    local title = page.dom:query_text("h1")
    if title == nil or title == "" then
        return nil
    end
    return {{
        title = title,
        url = page.url,
    }}
end

--- Return the image URLs for one extracted record.
function scraper.page_images(page, record)
    local images = {{}}
    for _, src in ipairs(page.dom:query_all_attr("img", "src")) do
        table.insert(images, url.join(page.url, src))
    end
    return images
end
"#
    )
}

/// Write `<name>.toml` and `<name>.lua` into `dir`. Refuses to overwrite.
pub fn scaffold(dir: &Path, name: &str) -> Result<(PathBuf, PathBuf)> {
    if name.is_empty() || name.contains(['/', '\\']) {
        bail!("Invalid name: '{}'", name);
    }
    let toml_path = dir.join(format!("{}.toml", name));
    let lua_path = dir.join(format!("{}.lua", name));
    for path in [&toml_path, &lua_path] {
        if path.exists() {
            bail!("File already exists: {}", path.display());
        }
    }

    std::fs::create_dir_all(dir)?;
    std::fs::write(&toml_path, action_template(name))?;
    std::fs::write(&lua_path, script_template(name))?;
    Ok((toml_path, lua_path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actions::Plan;
    use crate::config::{load_action_file, RunFlags, RunMode};

    #[test]
    fn scaffold_loads_and_refuses_to_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let (toml_path, lua_path) = scaffold(dir.path(), "gallery").unwrap();
        assert!(lua_path.exists());

        let flags = RunFlags {
            mode: RunMode::DryRun,
            debug: false,
            overwrite: false,
            delay_ms: None,
            timeout_ms: None,
        };
        let file = load_action_file(&toml_path, &flags).unwrap();
        assert_eq!(file.settings.source, "gallery");
        assert!(matches!(file.plan, Plan::Mirror(_)));

        let err = scaffold(dir.path(), "gallery").unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }
}
