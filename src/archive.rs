
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read as _, Write as _};
use std::path::{Component, Path, PathBuf};
use uuid::Uuid;

/// On-disk archive of raw client request bodies, gzipped, laid out as
/// `<data_dir>/requests/<client_ip>/<YYYY-MM-DD>/<stamp>_<id>.json.gz`.
/// All operations are blocking; callers run them on a blocking thread.
pub struct RequestArchive {
    dir: PathBuf,
}

impl RequestArchive {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            dir: data_dir.join("requests"),
        }
    }

    /// Writes one body and returns its path relative to the archive root.
    pub fn store(&self, client_ip: &str, body: &[u8]) -> anyhow::Result<String> {
        let safe_ip: String = client_ip
            .chars()
            .map(|c| if c == ':' || c == '/' || c == '\\' { '_' } else { c })
            .collect();
        let now = chrono::Utc::now();
        let date = now.format("%Y-%m-%d").to_string();
        let name = format!(
            "{}_{}.json.gz",
            now.format("%Y%m%dT%H%M%S"),
            Uuid::new_v4().simple()
        );

        let rel = format!("{safe_ip}/{date}/{name}");
        let full_dir = self.dir.join(&safe_ip).join(&date);
        std::fs::create_dir_all(&full_dir)?;

        let file = std::fs::File::create(full_dir.join(&name))?;
        let mut enc = GzEncoder::new(file, Compression::default());
        enc.write_all(body)?;
        enc.finish()?;
        Ok(rel)
    }

    /// Reads one archived body back, decompressed. Rejects paths that try
    /// to escape the archive root.
    pub fn read(&self, rel: &str) -> anyhow::Result<Vec<u8>> {
        let rel_path = Path::new(rel);
        if rel_path.is_absolute()
            || rel_path
                .components()
                .any(|c| matches!(c, Component::ParentDir))
        {
            anyhow::bail!("invalid archive path");
        }
        let file = std::fs::File::open(self.dir.join(rel_path))?;
        let mut out = Vec::new();
        GzDecoder::new(file).read_to_end(&mut out)?;
        Ok(out)
    }
}
