use std::path::Path;

use anyhow::Context;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MapError {
    #[error("map declares no provinces")]
    NoProvinces,
    #[error("map has {found} provinces, expected {expected}")]
    ProvinceMismatch { expected: u32, found: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MapSummary {
    pub title: Option<String>,
    pub provinces: u32,
}

/// Counts `#terrain` declarations, one per province, and picks up the title.
pub fn summarize(text: &str) -> MapSummary {
    let mut provinces = 0;
    let mut title = None;
    for line in text.lines().map(str::trim_start) {
        if line.starts_with("#terrain") {
            provinces += 1;
        } else if let Some(rest) = line.strip_prefix("#dom2title") {
            let t = rest.trim().trim_matches('"').trim();
            if !t.is_empty() {
                title = Some(t.to_string());
            }
        }
    }
    MapSummary { title, provinces }
}

pub fn check(summary: &MapSummary, expected: Option<u32>) -> Result<(), MapError> {
    if summary.provinces == 0 {
        return Err(MapError::NoProvinces);
    }
    match expected {
        Some(expected) if expected != summary.provinces => Err(MapError::ProvinceMismatch {
            expected,
            found: summary.provinces,
        }),
        _ => Ok(()),
    }
}

pub async fn validate_map(path: &Path, expected: Option<u32>) -> anyhow::Result<MapSummary> {
    let raw = tokio::fs::read(path)
        .await
        .with_context(|| format!("read map {}", path.display()))?;
    // Map files are usually Latin-1; only the ASCII directives matter here.
    let summary = summarize(&String::from_utf8_lossy(&raw));
    check(&summary, expected).with_context(|| format!("invalid map {}", path.display()))?;
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAP: &str = "#dom2title \"Silent Seas\"\n\
        #imagefile silent.tga\n\
        #terrain 1 0\n\
        #terrain 2 4096\n\
        \t#terrain 3 16\n\
        #landname 1 \"Nowhere\"\n";

    #[test]
    fn counts_provinces_and_title() {
        let s = summarize(MAP);
        assert_eq!(s.provinces, 3);
        assert_eq!(s.title.as_deref(), Some("Silent Seas"));
        assert_eq!(check(&s, None), Ok(()));
        assert_eq!(check(&s, Some(3)), Ok(()));
        assert_eq!(
            check(&s, Some(4)),
            Err(MapError::ProvinceMismatch {
                expected: 4,
                found: 3
            })
        );
    }

    #[test]
    fn empty_map_is_invalid() {
        let s = summarize("#dom2title x\n");
        assert_eq!(check(&s, None), Err(MapError::NoProvinces));
    }

    #[tokio::test]
    async fn validates_file_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("silent.map");
        std::fs::write(&path, MAP).unwrap();
        assert_eq!(validate_map(&path, Some(3)).await.unwrap().provinces, 3);

        let err = validate_map(&dir.path().join("missing.map"), None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing.map"));
    }
}
