//! Key management commands.
//!
//! `vibe keys generate` - Generate a new secret-sealing key.

use std::fs;
use std::path::PathBuf;

use vibe_vault::EncryptionKey;

/// Generate a new sealing key.
pub fn generate(output: Option<PathBuf>) -> anyhow::Result<()> {
    let key = EncryptionKey::generate().to_base64();

    if let Some(path) = output {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, &key)?;

        println!("✔ Generated sealing key: {}", path.display());
        println!();
        println!("⚠️  Keep this key secure! Losing it makes every stored credential unreadable.");
        println!();
        println!("Set as environment variable:");
        println!("  export VIBE_ENCRYPTION_KEY=$(cat {})", path.display());
    } else {
        println!("{key}");
        println!();
        println!("Use --output <file> to save the key to a file.");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_generate_key_to_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keys").join("vibe.key");
        generate(Some(path.clone())).unwrap();

        let encoded = fs::read_to_string(&path).unwrap();
        assert!(EncryptionKey::from_base64(&encoded).is_ok());
    }
}
