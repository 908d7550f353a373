//! Language detection by file extension.

/// Extension → language id. Order does not matter; lookups are exact.
const EXTENSIONS: &[(&str, &str)] = &[
    ("rs", "rust"),
    ("py", "python"),
    ("pyi", "python"),
    ("js", "javascript"),
    ("jsx", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("scala", "scala"),
    ("sh", "bash"),
    ("bash", "bash"),
    ("toml", "toml"),
    ("json", "json"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("md", "markdown"),
    ("sql", "sql"),
];

/// Extension of a repository-relative path, lowercased, without the dot.
pub fn extension(path: &str) -> Option<String> {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let (stem, ext) = file_name.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Detect the language id for a path, falling back to `"text"`.
pub fn detect_language(path: &str) -> &'static str {
    extension(path)
        .and_then(|ext| {
            EXTENSIONS
                .iter()
                .find(|(e, _)| *e == ext)
                .map(|(_, lang)| *lang)
        })
        .unwrap_or("text")
}

/// The extensions indexed when configuration does not override them.
pub fn default_extensions() -> Vec<String> {
    EXTENSIONS.iter().map(|(e, _)| (*e).to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_common_languages() {
        assert_eq!(detect_language("src/main.rs"), "rust");
        assert_eq!(detect_language("pkg/app.PY"), "python");
        assert_eq!(detect_language("web/index.tsx"), "typescript");
        assert_eq!(detect_language("notes.txt"), "text");
    }

    #[test]
    fn dotfiles_have_no_extension() {
        assert_eq!(extension(".gitignore"), None);
        assert_eq!(extension("dir.d/Makefile"), None);
        assert_eq!(extension("a/b/c.tar.gz"), Some("gz".to_string()));
    }
}
