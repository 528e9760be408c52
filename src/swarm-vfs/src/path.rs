/// Normalize a virtual path to an absolute forward-slash form with no
/// trailing slash ("/" stays "/"). Backslashes are folded, `.` and empty
/// components are dropped, `..` pops one component.
pub fn clean_path(p: &str) -> String {
    let replaced = p.replace('\\', "/");
    let mut out: Vec<&str> = Vec::new();
    for comp in replaced.split('/') {
        match comp {
            "" | "." => {}
            ".." => {
                out.pop();
            }
            c => out.push(c),
        }
    }
    if out.is_empty() {
        "/".to_string()
    } else {
        format!("/{}", out.join("/"))
    }
}

/// Split a cleaned path into (parent, file name). The parent is cleaned;
/// the root splits into ("/", "").
pub fn split_path(p: &str) -> (String, String) {
    let p = clean_path(p);
    if p == "/" {
        return ("/".to_string(), String::new());
    }
    match p.rfind('/') {
        Some(0) => ("/".to_string(), p[1..].to_string()),
        Some(i) => (p[..i].to_string(), p[i + 1..].to_string()),
        None => ("/".to_string(), p),
    }
}

/// Join two path fragments and clean the result.
pub fn join_path(base: &str, rest: &str) -> String {
    clean_path(&format!("{}/{}", base, rest))
}

/// First component of a cleaned relative or absolute path.
pub fn first_component(p: &str) -> &str {
    let p = p.trim_start_matches('/');
    match p.find('/') {
        Some(i) => &p[..i],
        None => p,
    }
}

/// Lower-cased extension including the dot, or empty. "a.tar.gz" yields
/// ".gz"; archive factories match on full suffixes instead.
pub fn file_ext(p: &str) -> String {
    let (_, name) = split_path(p);
    match name.rfind('.') {
        Some(i) if i > 0 => name[i..].to_ascii_lowercase(),
        _ => String::new(),
    }
}
