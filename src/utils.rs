use std::{
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::Path,
};

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use serde::{de::DeserializeOwned, Serialize};

/// JSON checkpoint persistence for every serde type the stages thread
/// through the work directory.
pub trait JsonExt {
    fn save_json<P>(&self, filename: P) -> Result<()>
    where
        P: AsRef<Path>,
        Self: Sized;
    fn load_json<P>(filename: P) -> Result<Self>
    where
        P: AsRef<Path>,
        Self: Sized;
}

impl<T> JsonExt for T
where
    T: Serialize + DeserializeOwned,
{
    fn save_json<P>(&self, filename: P) -> Result<()>
    where
        P: AsRef<Path>,
    {
        let path = filename.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, self)?;
        writer.flush()?;
        Ok(())
    }

    fn load_json<P>(filename: P) -> Result<Self>
    where
        P: AsRef<Path>,
    {
        let path = filename.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let value = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        Ok(value)
    }
}

/// Spinner wrapping a long scan, hidden unless progress was requested.
pub fn spinner(message: &'static str, show_progress: bool) -> ProgressBar {
    let pb = if show_progress {
        ProgressBar::new_spinner()
    } else {
        ProgressBar::hidden()
    };
    let style = ProgressStyle::default_spinner()
        .template("{spinner} [{elapsed_precise}] {pos} {msg}")
        .unwrap();
    pb.with_message(message).with_style(style)
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn json_roundtrip() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("nested/dir/table.json");
        let mut table = BTreeMap::new();
        table.insert("AAAACCCC".to_string(), 3u32);
        table.save_json(&path)?;
        let back = BTreeMap::<String, u32>::load_json(&path)?;
        assert_eq!(table, back);
        Ok(())
    }
}
