// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::{info, warn};

use crate::{checksum::FileRole, progress::Reporter, store::Versions};

use super::{
    Context, Error, Outcome, PendingStep, PipelineKind, Precondition, Request, Result, StepId,
};

impl Context<'_> {
    /// Return the app to its original state. Suspends for an uninstall
    /// followed by an install of the backed up APK.
    pub fn unpatch(&mut self, process_savedata: bool, reporter: &Reporter) -> Result<Outcome> {
        self.check_unpatch_preconditions(reporter)?;

        info!(
            "Unpatching {}: savedata={process_savedata}",
            self.target.package,
        );

        if process_savedata
            && let Err(e) = self.snapshot_savedata(reporter)
        {
            if let Err(re) = self.rollback_unpatch(false, reporter) {
                warn!("Failed to roll back unpatch: {re}");
            }
            return Err(e);
        }

        self.store.set_pending(Some(PendingStep {
            pipeline: PipelineKind::Unpatch,
            step: StepId::AwaitUninstall,
            process_savedata,
            update_only: false,
            obb_download: false,
            versions: Versions::default(),
            obb: None,
        }))?;

        Ok(Outcome::Suspended(Request::Uninstall {
            package: self.target.package.clone(),
        }))
    }

    fn check_unpatch_preconditions(&self, reporter: &Reporter) -> Result<()> {
        self.check_not_busy()?;

        if !self.store.is_patched() {
            return Err(Precondition::NotPatched.into());
        }

        reporter.step("Verifying backups");

        if !self.files.apk_backup.verify(&self.store, reporter)? {
            return Err(Error::MissingFile(FileRole::ApkBackup));
        }
        if !self.files.obb_backup.verify(&self.store, reporter)? {
            return Err(Error::MissingFile(FileRole::ObbBackup));
        }

        self.check_free_space()
    }

    fn snapshot_savedata(&mut self, reporter: &Reporter) -> Result<()> {
        reporter.step("Backing up save data");

        let files = &self.files;

        if !files.savedata.exists() {
            reporter.warning("No save data found; skipping snapshot");
            return Ok(());
        }

        files
            .savedata
            .copy_to(&files.savedata_snapshot, &mut self.store, reporter)?;

        Ok(())
    }

    /// Finish an unpatch run whose original APK is installed again. Safe to
    /// retry.
    pub(super) fn commit_unpatch(
        &mut self,
        pending: &PendingStep,
        reporter: &Reporter,
    ) -> Result<()> {
        let files = &self.files;

        reporter.step("Restoring OBB");
        if files.obb_backup.verify(&self.store, reporter)? {
            files
                .obb_backup
                .copy_to(&files.installed_obb, &mut self.store, reporter)?;
        } else if !files.installed_obb.verify(&self.store, reporter)? {
            // Only an earlier attempt of this commit can have consumed the
            // backup, and it recorded the restored OBB.
            return Err(Error::MissingFile(FileRole::ObbBackup));
        }

        if pending.process_savedata {
            reporter.step("Restoring save data");

            let source = if files.savedata_snapshot.verify(&self.store, reporter)? {
                Some(&files.savedata_snapshot)
            } else if files.savedata_backup.verify(&self.store, reporter)? {
                Some(&files.savedata_backup)
            } else {
                None
            };

            match source {
                Some(s) => {
                    s.copy_to(&files.savedata, &mut self.store, reporter)?;
                }
                None if files.savedata.verify(&self.store, reporter)? => {}
                None => reporter.warning("No save data to restore"),
            }

            files.savedata_snapshot.delete_if_exists(&mut self.store)?;
            files.savedata_backup.delete_if_exists(&mut self.store)?;
        }

        if self.recover_prior_backup(reporter)? {
            info!("Recovered prior save backup");
        }

        reporter.step("Removing backups");

        let files = &self.files;
        for file in [
            &files.apk_backup,
            &files.obb_backup,
            &files.signed_apk,
            &files.scripts,
        ] {
            file.delete_if_exists(&mut self.store)?;
        }

        self.store.update(|s| {
            // Files outside the managed root are no longer tracked.
            s.checksums.remove(FileRole::SaveData.key());
            s.checksums.remove(FileRole::InstalledObb.key());
            s.patched = false;
            s.versions = Versions::default();
            s.pending = None;
        })?;

        info!("Unpatch committed");

        Ok(())
    }

    pub(super) fn rollback_unpatch(
        &mut self,
        keep_snapshot: bool,
        reporter: &Reporter,
    ) -> Result<()> {
        info!("Rolling back unpatch");
        let reporter = &reporter.detached();

        if keep_snapshot {
            if self.files.savedata_snapshot.exists() {
                reporter.warning(format!(
                    "App was uninstalled; save data snapshot kept at {:?}",
                    self.files.savedata_snapshot.full_path(),
                ));
            }
        } else {
            self.files
                .savedata_snapshot
                .delete_if_exists(&mut self.store)?;
        }

        self.store.set_pending(None)?;

        Ok(())
    }
}
