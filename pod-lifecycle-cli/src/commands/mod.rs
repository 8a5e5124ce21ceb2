pub mod probe;
pub mod serve;

/// `name=target` pair from the command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedTarget {
    pub name: String,
    pub target: String,
}

/// Parse `name=target`; both sides must be non-empty
pub fn parse_named_target(value: &str) -> Result<NamedTarget, String> {
    let (name, target) = value
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=TARGET, got '{value}'"))?;
    let (name, target) = (name.trim(), target.trim());
    if name.is_empty() || target.is_empty() {
        return Err(format!("expected NAME=TARGET, got '{value}'"));
    }
    Ok(NamedTarget {
        name: name.to_string(),
        target: target.to_string(),
    })
}
