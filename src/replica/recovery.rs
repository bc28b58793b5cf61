//! Replica -- recovery from the mutation log.

use super::*;

use std::path::Path;

// Replica recovery from durable log
impl Replica {
    /// Opens the mutation log and replays it into the prepare list as an
    /// inactive replica. Mutations the storage engine already applied are
    /// skipped. Returns the log and the highest ballot seen in it.
    pub(super) async fn recover_from_log(
        name: &str,
        config: &ReplicaConfig,
        prepare_list: &mut PrepareList,
    ) -> Result<(MutationLog, Ballot), ReplogError> {
        let options = MutationLogOptions {
            max_block_bytes: config.max_block_bytes,
            max_log_file_bytes: config.max_log_file_mb * 1024 * 1024,
            sync: config.log_sync,
        };

        let mut max_ballot: Ballot = 0;
        let (mut replayed, mut skipped) = (0, 0);
        let log = MutationLog::open(
            name,
            Path::new(&config.log_dir),
            options,
            |_, mu| {
                max_ballot = cmp::max(max_ballot, mu.ballot());
                if mu.decree() <= prepare_list.last_committed_decree() {
                    skipped += 1;
                    return Ok(());
                }
                let err = prepare_list.prepare(mu, PartitionStatus::Inactive)?;
                if err.is_ok() {
                    replayed += 1;
                }
                Ok(())
            },
        )
        .await?;

        pf_info!(
            name;
            "replayed {} mutations ({} already applied), last_committed_decree {}",
            replayed, skipped, prepare_list.last_committed_decree()
        );
        Ok((log, max_ballot))
    }
}
