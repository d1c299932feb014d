//! Display order of the file tree: dotfiles, directories, compose manifests,
//! other yaml, everything else. Ties sort by name.

use crate::compose::MANIFEST_NAMES;
use std::cmp::Ordering;

fn base_name(name: &str) -> &str {
    name.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(name)
}

pub fn rank(name: &str, is_dir: bool) -> u8 {
    let base = base_name(name);
    if base.starts_with('.') {
        0
    } else if is_dir {
        1
    } else if MANIFEST_NAMES.contains(&base) {
        2
    } else if base.ends_with(".yaml") || base.ends_with(".yml") {
        3
    } else {
        4
    }
}

pub fn compare(a: &str, a_is_dir: bool, b: &str, b_is_dir: bool) -> Ordering {
    rank(a, a_is_dir)
        .cmp(&rank(b, b_is_dir))
        .then_with(|| a.cmp(b))
}
