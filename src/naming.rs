//! Deterministic names and paths for a single run

use chrono::NaiveDateTime;
use std::path::{Path, PathBuf};

/// Timestamp layout embedded in every derived name
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Everything a run names, derived from the source instance, the logical
/// database and the run timestamp
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunNames {
    /// Identifier of the temporary restored instance
    pub instance_id: String,
    /// File name of the uncompressed export (`.sql`)
    pub export_file_name: String,
    /// File name of the compressed export (`.sql.gz`)
    pub archive_file_name: String,
    pub export_path: PathBuf,
    pub archive_path: PathBuf,
    /// Database created on the mirror host for this run
    pub mirror_database: String,
    /// Prefix shared by every mirror database of this source database
    pub mirror_prefix: String,
    /// Object key the archive is stored under
    pub archive_key: String,
    /// Key prefix shared by every archive of this source instance
    pub archive_prefix: String,
}

impl RunNames {
    pub fn derive(
        source_instance_id: &str,
        database: &str,
        dump_directory: &Path,
        key_prefix: &str,
        timestamp: NaiveDateTime,
    ) -> Self {
        let stamp = timestamp.format(TIMESTAMP_FORMAT).to_string();

        let export_file_name = format!("{}-mysqldump-{}.sql", source_instance_id, stamp);
        let archive_file_name = format!("{}.gz", export_file_name);
        let mirror_prefix = mirror_prefix(database);

        Self {
            instance_id: format!("dump-{}-{}", source_instance_id, stamp),
            export_path: dump_directory.join(&export_file_name),
            archive_path: dump_directory.join(&archive_file_name),
            mirror_database: format!("{}{}", mirror_prefix, stamp),
            mirror_prefix,
            archive_key: join_key(key_prefix, &archive_file_name),
            archive_prefix: join_key(key_prefix, &format!("{}-mysqldump-", source_instance_id)),
            export_file_name,
            archive_file_name,
        }
    }
}

/// `dump_<database>_`
pub fn mirror_prefix(database: &str) -> String {
    format!("dump_{}_", database)
}

/// Joins an object key prefix and a name with exactly one `/` between them
pub fn join_key(prefix: &str, name: &str) -> String {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}
