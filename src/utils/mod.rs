use url::Url;

use crate::AdmissionError;

/// Validate a source URL and return its normalized form
pub fn validate_source_url(url: &str, max_len: usize) -> Result<String, AdmissionError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(AdmissionError::InvalidInput("empty URL".to_string()));
    }
    if url.len() > max_len {
        return Err(AdmissionError::InvalidInput(format!(
            "URL longer than {} characters",
            max_len
        )));
    }

    let parsed = Url::parse(url)
        .map_err(|_| AdmissionError::InvalidInput(format!("invalid URL format: {}", url)))?;

    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(AdmissionError::InvalidInput(
            "URL must use HTTP or HTTPS protocol".to_string(),
        ));
    }

    if parsed.host_str().map_or(true, |host| host.is_empty()) {
        return Err(AdmissionError::InvalidInput("URL has no host".to_string()));
    }

    Ok(parsed.to_string())
}

/// Format file size in human-readable format
pub fn format_file_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log10() / THRESHOLD.log10()).floor() as usize;
    let unit_index = unit_index.min(UNITS.len() - 1);

    let size = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", size, UNITS[unit_index])
    }
}

/// Format duration in human-readable format
pub fn format_duration(seconds: f64) -> String {
    let total_seconds = seconds as u64;
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let secs = total_seconds % 60;

    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Sanitize filename for safe filesystem usage
pub fn sanitize_filename(filename: &str) -> String {
    filename
        .chars()
        .map(|c| {
            match c {
                // Keep alphanumeric characters, spaces, hyphens, underscores, and dots
                c if c.is_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.' => c,
                _ => '_',
            }
        })
        .collect::<String>()
        .trim()
        .to_string()
}

/// Generate a unique filename with timestamp
pub fn generate_unique_filename(base_name: &str, extension: &str) -> String {
    let timestamp = chrono::Utc::now().format("%Y%m%d_%H%M%S");
    let random_suffix = uuid::Uuid::new_v4().to_string()[..8].to_string();

    format!(
        "{}_{}_{}.{}",
        sanitize_filename(base_name),
        timestamp,
        random_suffix,
        extension
    )
}

/// Extract domain from URL for display purposes
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url).ok()?.host_str().map(|host| {
        // Remove 'www.' prefix if present
        host.strip_prefix("www.").unwrap_or(host).to_string()
    })
}

/// Check whether the external tools are reachable
pub async fn check_dependencies(programs: &[(&str, &str)]) -> Vec<String> {
    let mut missing = Vec::new();

    for (program, purpose) in programs {
        if !check_command_available(program).await {
            missing.push(format!("{} - {}", program, purpose));
        }
    }

    missing
}

/// Check if a command is available in PATH
async fn check_command_available(command: &str) -> bool {
    use tokio::process::Command;

    // ffmpeg and ffprobe only understand -version
    let flag = if command.contains("ff") {
        "-version"
    } else {
        "--version"
    };

    Command::new(command)
        .arg(flag)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_file_size() {
        assert_eq!(format_file_size(0), "0 B");
        assert_eq!(format_file_size(512), "512 B");
        assert_eq!(format_file_size(1024), "1.0 KB");
        assert_eq!(format_file_size(1536), "1.5 KB");
        assert_eq!(format_file_size(1048576), "1.0 MB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30.0), "30s");
        assert_eq!(format_duration(90.0), "1m 30s");
        assert_eq!(format_duration(3661.0), "1h 1m 1s");
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("Hello World!"), "Hello World_");
        assert_eq!(sanitize_filename("test/file?name"), "test_file_name");
        assert_eq!(sanitize_filename("  spaced  "), "spaced");
    }

    #[test]
    fn test_generate_unique_filename() {
        let a = generate_unique_filename("out/put", "mp3");
        let b = generate_unique_filename("out/put", "mp3");
        assert!(a.starts_with("out_put_"));
        assert!(a.ends_with(".mp3"));
        assert_ne!(a, b);
    }

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://www.youtube.com/watch?v=123"),
            Some("youtube.com".to_string())
        );
        assert_eq!(
            extract_domain("https://soundcloud.com/artist/track"),
            Some("soundcloud.com".to_string())
        );
        assert_eq!(extract_domain("invalid-url"), None);
    }

    #[test]
    fn test_validate_source_url() {
        assert!(validate_source_url("https://example.com/v/1", 2048).is_ok());
        assert!(validate_source_url("  http://example.com  ", 2048).is_ok());

        for bad in ["", "   ", "not-a-url", "ftp://example.com/a", "file:///etc/passwd"] {
            assert!(
                matches!(
                    validate_source_url(bad, 2048),
                    Err(AdmissionError::InvalidInput(_))
                ),
                "{bad:?} should be rejected"
            );
        }

        let long = format!("https://example.com/{}", "a".repeat(100));
        assert!(validate_source_url(&long, 50).is_err());
    }

    #[test]
    fn test_check_dependencies_reports_missing() {
        let missing =
            tokio_test::block_on(check_dependencies(&[("no-such-tool-4711", "needed for tests")]));
        assert_eq!(missing, vec!["no-such-tool-4711 - needed for tests".to_string()]);
    }
}
