//! Filename prefix/suffix helpers.
//!
//! Batch tools in this domain name their artifacts by convention:
//! `sub-01_bold_moco.nii.gz` is the motion-corrected derivative of
//! `sub-01_bold.nii.gz`. These helpers manipulate that convention: the
//! prefix is the basename with every extension stripped, a suffix is a
//! trailing `_part` of the prefix.
//!
//! Everything operates on the string form with `/` separators, mirroring
//! how the paths travel through stage input maps.

/// Basename with every extension stripped.
///
/// Extensions are stripped repeatedly, so `a/b.tar.gz` gives `b`. Leading
/// dots are not extensions: `.bashrc` stays `.bashrc`.
pub fn get_prefix(filename: &str) -> String {
    let mut name = basename(filename).to_string();
    loop {
        let (stem, ext) = splitext(&name);
        if ext.is_empty() {
            return name;
        }
        name = stem;
    }
}

/// Like [`get_prefix`] but keeping the directory part.
pub fn get_path_and_prefix(filename: &str) -> String {
    join(dirname(filename), &get_prefix(filename))
}

/// Append a suffix before the extensions: `a/b_x.nii.gz` + `_y` gives
/// `a/b_x_y.nii.gz`. No separator is inserted automatically.
pub fn append_suffix(filename: &str, suffix: &str) -> String {
    let prefix = get_path_and_prefix(filename);
    let ext = &filename[prefix.len()..];
    format!("{prefix}{suffix}{ext}")
}

/// Replace the last `_suffix` of the prefix: `a/b_x.nii` + `_y` gives
/// `a/b_y.nii`.
pub fn replace_suffix(filename: &str, suffix: &str) -> String {
    let prefix = get_path_and_prefix(filename);
    let ext = &filename[prefix.len()..];
    let trimmed = drop_last_suffix(&prefix);
    format!("{trimmed}{suffix}{ext}")
}

/// Delete the last `_suffix` of the prefix: `a/b_x.nii` gives `a/b.nii`.
pub fn delete_suffix(filename: &str) -> String {
    let prefix = get_path_and_prefix(filename);
    let ext = &filename[prefix.len()..];
    let trimmed = drop_last_suffix(&prefix);
    format!("{trimmed}{ext}")
}

/// Move a filename into a different directory.
pub fn repath(dirname: &str, filename: &str) -> String {
    join(dirname, basename(filename))
}

fn drop_last_suffix(prefix: &str) -> String {
    match prefix.rfind('_') {
        Some(i) => prefix[..i].to_string(),
        None => String::new(),
    }
}

fn basename(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[i + 1..],
        None => path,
    }
}

fn dirname(path: &str) -> &str {
    match path.rfind('/') {
        Some(i) => &path[..i],
        None => "",
    }
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Split off the last extension, Python-style: leading dots never count.
fn splitext(name: &str) -> (String, String) {
    let leading = name.chars().take_while(|c| *c == '.').count();
    let threshold = leading.max(1);
    match name.rfind('.') {
        Some(i) if i >= threshold => (name[..i].to_string(), name[i..].to_string()),
        _ => (name.to_string(), String::new()),
    }
}

/// Chainable wrapper over the free functions, for call sites that apply
/// several operations in sequence.
///
/// ```
/// use memo_core::path::PathManager;
/// let p = PathManager::new("/data/sub-01_bold.nii.gz")
///     .append_suffix("_moco")
///     .repath("/scratch");
/// assert_eq!(p.path(), "/scratch/sub-01_bold_moco.nii.gz");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathManager {
    path: String,
}

impl PathManager {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }

    /// The managed path as a string.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn get_prefix(self) -> Self {
        Self::new(get_prefix(&self.path))
    }

    pub fn get_path_and_prefix(self) -> Self {
        Self::new(get_path_and_prefix(&self.path))
    }

    pub fn append_suffix(self, suffix: &str) -> Self {
        Self::new(append_suffix(&self.path, suffix))
    }

    pub fn replace_suffix(self, suffix: &str) -> Self {
        Self::new(replace_suffix(&self.path, suffix))
    }

    pub fn delete_suffix(self) -> Self {
        Self::new(delete_suffix(&self.path))
    }

    pub fn repath(self, dirname: &str) -> Self {
        Self::new(repath(dirname, &self.path))
    }
}

impl std::fmt::Display for PathManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.path)
    }
}
