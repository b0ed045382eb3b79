//! Serde-tagged command surface for host applications.
//!
//! Each manager speaks its own command enum; the wire shape is a JSON
//! object with a `cmd` discriminant, so a host can forward messages
//! straight off an IPC channel without routing logic of its own.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use duffel_storage::RemoteObject;

use crate::download_manager::DownloadManager;
use crate::manager::{ConfigUpdate, JobCounters, JobPage, JobQuery};
use crate::upload_manager::UploadManager;
use crate::TransferError;

fn default_per_page() -> usize {
    50
}

/// Commands understood by an [`UploadManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum UploadCommand {
    /// Queue uploads for local files and directories.
    AddPaths {
        region: String,
        bucket: String,
        #[serde(default)]
        key_prefix: String,
        paths: Vec<PathBuf>,
    },
    Start {
        id: String,
        #[serde(default)]
        forced: bool,
    },
    Stop {
        id: String,
    },
    Wait {
        id: String,
    },
    Remove {
        id: String,
    },
    StartAll,
    StopAll,
    RemoveAll,
    CleanupFinished,
    List {
        #[serde(default)]
        page: usize,
        #[serde(default = "default_per_page")]
        per_page: usize,
        #[serde(default)]
        query: JobQuery,
    },
    Counters,
    UpdateConfig {
        #[serde(flatten)]
        update: ConfigUpdate,
    },
}

/// Commands understood by a [`DownloadManager`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DownloadCommand {
    /// Queue downloads for remote objects and directory prefixes.
    AddRemote {
        region: String,
        selections: Vec<RemoteObject>,
        local_root: PathBuf,
    },
    Start {
        id: String,
        #[serde(default)]
        forced: bool,
    },
    Stop {
        id: String,
    },
    Wait {
        id: String,
    },
    Remove {
        id: String,
    },
    StartAll,
    StopAll,
    RemoveAll,
    CleanupFinished,
    List {
        #[serde(default)]
        page: usize,
        #[serde(default = "default_per_page")]
        per_page: usize,
        #[serde(default)]
        query: JobQuery,
    },
    Counters,
    UpdateConfig {
        #[serde(flatten)]
        update: ConfigUpdate,
    },
}

/// Reply to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandReply {
    Ok,
    Added { count: usize },
    Page { page: JobPage },
    Counters { counters: JobCounters },
}

pub async fn handle_upload_command(
    manager: &UploadManager,
    command: UploadCommand,
) -> Result<CommandReply, TransferError> {
    match command {
        UploadCommand::AddPaths {
            region,
            bucket,
            key_prefix,
            paths,
        } => {
            let count = manager
                .add_jobs_from_paths(&region, &bucket, &key_prefix, &paths)
                .await;
            Ok(CommandReply::Added { count })
        }
        UploadCommand::Start { id, forced } => {
            manager.start_job(&id, forced)?;
            Ok(CommandReply::Ok)
        }
        UploadCommand::Stop { id } => {
            manager.stop_job(&id)?;
            Ok(CommandReply::Ok)
        }
        UploadCommand::Wait { id } => {
            manager.wait_job(&id)?;
            Ok(CommandReply::Ok)
        }
        UploadCommand::Remove { id } => {
            manager.remove_job(&id)?;
            Ok(CommandReply::Ok)
        }
        UploadCommand::StartAll => {
            manager.start_all_jobs();
            Ok(CommandReply::Ok)
        }
        UploadCommand::StopAll => {
            manager.stop_all_jobs(None);
            Ok(CommandReply::Ok)
        }
        UploadCommand::RemoveAll => {
            manager.remove_all_jobs();
            Ok(CommandReply::Ok)
        }
        UploadCommand::CleanupFinished => {
            manager.cleanup_finished_jobs();
            Ok(CommandReply::Ok)
        }
        UploadCommand::List {
            page,
            per_page,
            query,
        } => Ok(CommandReply::Page {
            page: manager.ui_page(page, per_page, &query),
        }),
        UploadCommand::Counters => Ok(CommandReply::Counters {
            counters: manager.counters(),
        }),
        UploadCommand::UpdateConfig { update } => {
            manager.update_config(update);
            Ok(CommandReply::Ok)
        }
    }
}

pub async fn handle_download_command(
    manager: &DownloadManager,
    command: DownloadCommand,
) -> Result<CommandReply, TransferError> {
    match command {
        DownloadCommand::AddRemote {
            region,
            selections,
            local_root,
        } => {
            let count = manager
                .add_jobs_from_remote(&region, &selections, &local_root)
                .await?;
            Ok(CommandReply::Added { count })
        }
        DownloadCommand::Start { id, forced } => {
            manager.start_job(&id, forced)?;
            Ok(CommandReply::Ok)
        }
        DownloadCommand::Stop { id } => {
            manager.stop_job(&id)?;
            Ok(CommandReply::Ok)
        }
        DownloadCommand::Wait { id } => {
            manager.wait_job(&id)?;
            Ok(CommandReply::Ok)
        }
        DownloadCommand::Remove { id } => {
            manager.remove_job(&id)?;
            Ok(CommandReply::Ok)
        }
        DownloadCommand::StartAll => {
            manager.start_all_jobs();
            Ok(CommandReply::Ok)
        }
        DownloadCommand::StopAll => {
            manager.stop_all_jobs(None);
            Ok(CommandReply::Ok)
        }
        DownloadCommand::RemoveAll => {
            manager.remove_all_jobs();
            Ok(CommandReply::Ok)
        }
        DownloadCommand::CleanupFinished => {
            manager.cleanup_finished_jobs();
            Ok(CommandReply::Ok)
        }
        DownloadCommand::List {
            page,
            per_page,
            query,
        } => Ok(CommandReply::Page {
            page: manager.ui_page(page, per_page, &query),
        }),
        DownloadCommand::Counters => Ok(CommandReply::Counters {
            counters: manager.counters(),
        }),
        DownloadCommand::UpdateConfig { update } => {
            manager.update_config(update);
            Ok(CommandReply::Ok)
        }
    }
}
