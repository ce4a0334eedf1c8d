//! Script sources for PREPARE.

use std::path::{Component, Path};

use bytes::Bytes;
use wirescript_core::ScriptError;

/// Script text for a PREPARE request: the inline content if present,
/// otherwise the named files under `root`, concatenated in order.
///
/// # Errors
///
/// `ScriptError::Source` if there is nothing to load, a name escapes the
/// script root, a file cannot be read, or the text is not UTF-8.
pub async fn load_script(
    root: Option<&Path>,
    content: Option<&Bytes>,
    names: &[String],
) -> Result<String, ScriptError> {
    if let Some(content) = content {
        return String::from_utf8(content.to_vec())
            .map_err(|_| ScriptError::Source("script content is not valid UTF-8".to_string()));
    }
    if names.is_empty() {
        return Err(ScriptError::Source(
            "PREPARE carries neither content nor a script name".to_string(),
        ));
    }
    let root = root.ok_or_else(|| ScriptError::Source("no script root configured".to_string()))?;

    let mut text = String::new();
    for name in names {
        let relative = Path::new(name);
        if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
            let message = format!("script name `{name}` escapes the script root");
            return Err(ScriptError::Source(message));
        }
        let bytes = tokio::fs::read(root.join(relative))
            .await
            .map_err(|err| ScriptError::Source(format!("cannot read `{name}`: {err}")))?;
        let part = String::from_utf8(bytes)
            .map_err(|_| ScriptError::Source(format!("`{name}` is not valid UTF-8")))?;
        text.push_str(&part);
        if !text.ends_with('\n') {
            text.push('\n');
        }
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inline_content_wins() {
        let content = Bytes::from_static(b"accept tcp://h:1\n");
        let text = load_script(None, Some(&content), &["ignored".to_string()]).await.unwrap();
        assert_eq!(text, "accept tcp://h:1\n");
    }

    #[tokio::test]
    async fn named_scripts_are_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.ws"), "accept tcp://h:1").unwrap();
        std::fs::write(dir.path().join("b.ws"), "connect tcp://h:1\n").unwrap();

        let names = ["a.ws".to_string(), "b.ws".to_string()];
        let text = load_script(Some(dir.path()), None, &names).await.unwrap();
        assert_eq!(text, "accept tcp://h:1\nconnect tcp://h:1\n");
    }

    #[tokio::test]
    async fn names_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_script(Some(dir.path()), None, &["../x.ws".to_string()]).await.unwrap_err();
        assert!(matches!(err, ScriptError::Source(_)));
    }

    #[tokio::test]
    async fn nothing_to_load_is_an_error() {
        assert!(load_script(None, None, &[]).await.is_err());
        assert!(load_script(None, None, &["a.ws".to_string()]).await.is_err());
    }
}
