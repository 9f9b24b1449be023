use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Hash and length of a piece of content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentDigest {
    pub hash: String,
    pub size: u64,
}

/// Stream a reader through SHA-256, counting bytes as they go by.
pub async fn hash_reader<R: AsyncRead + Unpin>(mut reader: R) -> Result<ContentDigest> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok(ContentDigest {
        hash: format!("{:x}", hasher.finalize()),
        size,
    })
}

pub async fn hash_file<P: AsRef<Path>>(path: P) -> Result<ContentDigest> {
    let path = path.as_ref();
    let file = File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    hash_reader(file).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hashes_bytes_and_counts_size() {
        let digest = hash_reader(&b"hello"[..]).await.unwrap();
        assert_eq!(
            digest.hash,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest.size, 5);
    }

    #[tokio::test]
    async fn file_and_reader_agree() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("blob");
        let data = vec![7u8; 200_000];
        std::fs::write(&path, &data).unwrap();
        let from_file = hash_file(&path).await.unwrap();
        let from_reader = hash_reader(&data[..]).await.unwrap();
        assert_eq!(from_file, from_reader);
        assert_eq!(from_file.size, 200_000);
    }
}
