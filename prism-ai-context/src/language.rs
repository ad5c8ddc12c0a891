//! File-type categories and language detection.
//!
//! The tables here double as the allow-list used by [`crate::filter`]: a file
//! whose suffix appears in [`EXTENSION_LANGUAGES`], or whose name appears in
//! [`SPECIAL_FILES`], is a candidate for embedding.

use std::path::Path;

/// Recognized file suffixes and the language label stored alongside their embeddings.
pub const EXTENSION_LANGUAGES: &[(&str, &str)] = &[
    // Source code
    ("rs", "rust"),
    ("py", "python"),
    ("pyi", "python"),
    ("js", "javascript"),
    ("mjs", "javascript"),
    ("cjs", "javascript"),
    ("jsx", "javascript"),
    ("ts", "typescript"),
    ("tsx", "typescript"),
    ("go", "go"),
    ("java", "java"),
    ("kt", "kotlin"),
    ("kts", "kotlin"),
    ("scala", "scala"),
    ("c", "c"),
    ("h", "c"),
    ("cc", "cpp"),
    ("cpp", "cpp"),
    ("cxx", "cpp"),
    ("hpp", "cpp"),
    ("cs", "csharp"),
    ("rb", "ruby"),
    ("php", "php"),
    ("swift", "swift"),
    ("m", "objective-c"),
    ("lua", "lua"),
    ("pl", "perl"),
    ("r", "r"),
    ("dart", "dart"),
    ("ex", "elixir"),
    ("exs", "elixir"),
    ("erl", "erlang"),
    ("hs", "haskell"),
    ("clj", "clojure"),
    ("vue", "vue"),
    ("svelte", "svelte"),
    ("sql", "sql"),
    ("sh", "shell"),
    ("bash", "shell"),
    ("zsh", "shell"),
    ("ps1", "powershell"),
    ("groovy", "groovy"),
    ("tf", "terraform"),
    ("proto", "protobuf"),
    ("graphql", "graphql"),
    // Markup and styles
    ("html", "html"),
    ("htm", "html"),
    ("xml", "xml"),
    ("css", "css"),
    ("scss", "scss"),
    ("less", "less"),
    // Documentation
    ("md", "markdown"),
    ("markdown", "markdown"),
    ("rst", "restructuredtext"),
    ("txt", "text"),
    ("adoc", "asciidoc"),
    // Configuration
    ("json", "json"),
    ("yaml", "yaml"),
    ("yml", "yaml"),
    ("toml", "toml"),
    ("ini", "ini"),
    ("cfg", "ini"),
    ("conf", "config"),
    ("properties", "properties"),
    ("gradle", "groovy"),
    ("env", "dotenv"),
];

/// Files without a type suffix that are always worth embedding.
pub const SPECIAL_FILES: &[(&str, &str)] = &[
    ("Dockerfile", "dockerfile"),
    ("Containerfile", "dockerfile"),
    ("Makefile", "makefile"),
    ("GNUmakefile", "makefile"),
    ("CMakeLists.txt", "cmake"),
    ("Jenkinsfile", "groovy"),
    ("Procfile", "text"),
    ("Gemfile", "ruby"),
    ("Rakefile", "ruby"),
    ("Vagrantfile", "ruby"),
    ("README", "text"),
    ("LICENSE", "text"),
    ("CHANGELOG", "text"),
    ("CONTRIBUTING", "text"),
    ("CODEOWNERS", "text"),
    (".gitignore", "gitignore"),
    (".dockerignore", "gitignore"),
    (".editorconfig", "ini"),
    (".gitlab-ci.yml", "yaml"),
];

/// Returns the file name component of a repository path.
fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}

/// Returns the lower-cased suffix of a path, if it has one.
pub fn extension_of(path: &str) -> Option<String> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
}

/// Looks up the language for a special, suffix-less file name.
pub fn special_file_language(path: &str) -> Option<&'static str> {
    let name = file_name(path);
    SPECIAL_FILES
        .iter()
        .find(|(special, _)| *special == name)
        .map(|(_, lang)| *lang)
}

/// Looks up the language for a recognized suffix.
pub fn extension_language(path: &str) -> Option<&'static str> {
    let ext = extension_of(path)?;
    EXTENSION_LANGUAGES
        .iter()
        .find(|(known, _)| *known == ext)
        .map(|(_, lang)| *lang)
}

/// Detects the language label for a path, falling back to `"text"`.
///
/// Special file names win over suffixes so that `CMakeLists.txt` is labelled
/// `cmake` rather than `text`.
pub fn detect_language(path: &str) -> &'static str {
    special_file_language(path)
        .or_else(|| extension_language(path))
        .unwrap_or("text")
}
