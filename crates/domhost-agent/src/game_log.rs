use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use tokio::{io::AsyncWriteExt, sync::mpsc};

/// Appends a game's console output to `<dir>/<YYYY-MM-DD>.log`.
///
/// The date is compared on every write, and a new file is opened when it
/// changes.
pub struct DailyLogWriter {
    dir: PathBuf,
    date: NaiveDate,
    file: tokio::fs::File,
}

fn today() -> NaiveDate {
    chrono::Local::now().date_naive()
}

fn log_path(dir: &Path, date: NaiveDate) -> PathBuf {
    dir.join(format!("{}.log", date.format("%Y-%m-%d")))
}

async fn open_append(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
}

impl DailyLogWriter {
    pub async fn open(dir: PathBuf) -> std::io::Result<Self> {
        tokio::fs::create_dir_all(&dir).await?;
        let date = today();
        let file = open_append(&log_path(&dir, date)).await?;
        Ok(Self { dir, date, file })
    }

    pub fn current_path(&self) -> PathBuf {
        log_path(&self.dir, self.date)
    }

    async fn roll_if_needed(&mut self, now: NaiveDate) -> std::io::Result<()> {
        if now == self.date {
            return Ok(());
        }
        let _ = self.file.flush().await;
        self.file = open_append(&log_path(&self.dir, now)).await?;
        self.date = now;
        Ok(())
    }

    pub async fn write_line(&mut self, line: &str) -> std::io::Result<()> {
        self.write_line_on(today(), line).await
    }

    async fn write_line_on(&mut self, date: NaiveDate, line: &str) -> std::io::Result<()> {
        self.roll_if_needed(date).await?;
        let mut line = line.to_string();
        if !line.ends_with('\n') {
            line.push('\n');
        }
        self.file.write_all(line.as_bytes()).await
    }
}

/// Spawns a writer task and returns its queue. Sending never blocks the caller.
pub fn spawn_writer(dir: PathBuf) -> mpsc::UnboundedSender<String> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    tokio::spawn(async move {
        let mut writer = match DailyLogWriter::open(dir.clone()).await {
            Ok(w) => w,
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "failed to open game log");
                // Keep draining so senders never see a closed queue mid-run.
                while rx.recv().await.is_some() {}
                return;
            }
        };
        while let Some(line) = rx.recv().await {
            if let Err(e) = writer.write_line(&line).await {
                tracing::warn!(path = %writer.current_path().display(), error = %e, "failed to write game log");
            }
        }
        let _ = writer.file.flush().await;
    });
    tx
}
