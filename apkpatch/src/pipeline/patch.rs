// SPDX-FileCopyrightText: 2026 The apkpatch Authors
// SPDX-License-Identifier: GPL-3.0-only

use tracing::{debug, info, warn};

use crate::{
    checksum::{self, ChecksumStore, FileRole},
    file::VerifiableFile,
    format::manifest::Manifest,
    patch::apk,
    progress::Reporter,
    sign::ApkSigner,
    store::Versions,
};

use super::{
    Context, Error, Outcome, PatchUpdateState, PendingStep, PipelineKind, Precondition,
    ProcessState, Request, Result, StepId, fetch_artifact,
};

/// What the pre-handoff half of a patch run produced.
struct Prepared {
    pending: PendingStep,
    /// The installed APK is not the signed one.
    install: bool,
}

impl Context<'_> {
    /// Patch the app with the components listed in `manifest`.
    ///
    /// On a first patch, this suspends for an uninstall followed by an
    /// install of the signed APK. When the app is already patched and only
    /// some components are newer, the run updates those in place: the
    /// uninstall is skipped, and so is the install if the signed APK did not
    /// change.
    pub fn patch(
        &mut self,
        manifest: &Manifest,
        process_savedata: bool,
        signer: &dyn ApkSigner,
        reporter: &Reporter,
    ) -> Result<Outcome> {
        manifest.validate().map_err(Error::Validation)?;

        let state = ProcessState {
            process_savedata,
            patch_updates: self.update_state(manifest),
        };

        self.check_patch_preconditions(&state)?;

        let prepared = match self.prepare_patch(manifest, &state, signer, reporter) {
            Ok(p) => p,
            Err(e) => {
                if let Err(re) = self.rollback_patch(false, reporter) {
                    warn!("Failed to roll back patch: {re}");
                }
                return Err(e);
            }
        };

        let mut pending = prepared.pending;

        if !pending.update_only {
            pending.step = StepId::AwaitUninstall;
            self.store.set_pending(Some(pending))?;

            Ok(Outcome::Suspended(Request::Uninstall {
                package: self.target.package.clone(),
            }))
        } else if prepared.install {
            pending.step = StepId::AwaitInstall;
            self.store.set_pending(Some(pending))?;

            Ok(Outcome::Suspended(Request::Install {
                apk: self.files.signed_apk.full_path(),
            }))
        } else {
            debug!("Signed APK is already installed; committing without reinstall");

            pending.step = StepId::Commit;
            self.store.set_pending(Some(pending.clone()))?;
            self.commit_patch(&pending, reporter)?;

            Ok(Outcome::Committed)
        }
    }

    fn check_patch_preconditions(&self, state: &ProcessState) -> Result<()> {
        self.check_not_busy()?;

        if self.store.is_patched() && !state.patch_updates.update_available() {
            return Err(Precondition::AlreadyPatched.into());
        }

        if !self.device.is_installed(&self.target.package)? {
            return Err(Precondition::NotInstalled(self.target.package.clone()).into());
        }

        self.check_free_space()
    }

    fn prepare_patch(
        &mut self,
        manifest: &Manifest,
        state: &ProcessState,
        signer: &dyn ApkSigner,
        reporter: &Reporter,
    ) -> Result<Prepared> {
        let update_only = self.store.is_patched();
        let updates = state.patch_updates;
        // An update-only run never uninstalls, so the save data stays put.
        let process_savedata = state.process_savedata && !update_only;

        info!(
            "Patching {}: update_only={update_only}, savedata={process_savedata}, \
             updates={updates:?}",
            self.target.package,
        );

        if process_savedata {
            self.backup_savedata(reporter)?;
        }

        let base_changed = self.acquire_base_apk(update_only, &updates, reporter)?;

        reporter.step("Checking scripts");
        let scripts_changed = fetch_artifact(
            &mut self.store,
            self.downloader,
            &manifest.scripts,
            &self.files.scripts,
            reporter,
        )?;

        let resigned = if base_changed
            || scripts_changed
            || !self.files.signed_apk.verify(&self.store, reporter)?
        {
            self.rewrite_archive(signer, reporter)?;
            true
        } else {
            false
        };

        // A previous update run may have re-signed the APK and then failed
        // to install it.
        let install =
            resigned || (update_only && self.installed_differs_from_signed(reporter)?);

        if !update_only {
            self.backup_obb(reporter)?;
        }

        // The uninstall wipes the installed OBB, so a first patch always
        // installs a fresh one.
        let obb_download = !update_only || updates.obb;
        let applied = self.store.versions();

        Ok(Prepared {
            pending: PendingStep {
                pipeline: PipelineKind::Patch,
                step: StepId::AwaitUninstall,
                process_savedata,
                update_only,
                obb_download,
                versions: Versions {
                    scripts: Some(manifest.scripts.version),
                    obb: if obb_download {
                        Some(manifest.obb.version)
                    } else {
                        applied.obb
                    },
                },
                obb: obb_download.then(|| manifest.obb.clone()),
            },
            install,
        })
    }

    fn installed_differs_from_signed(&self, reporter: &Reporter) -> Result<bool> {
        let Some(signed) = self.store.get(FileRole::SignedApk) else {
            return Ok(true);
        };

        let path = self.device.installed_apk(&self.target.package)?;
        let installed = VerifiableFile::from_path(&path, FileRole::InstalledApk);

        Ok(!checksum::hashes_equal(&installed.hash(reporter)?, signed))
    }

    /// Set aside any existing save backup and snapshot the live save data.
    fn backup_savedata(&mut self, reporter: &Reporter) -> Result<()> {
        reporter.step("Backing up save data");

        let files = &self.files;

        if files.savedata_backup.verify(&self.store, reporter)? {
            if files.savedata_prior.verify(&self.store, reporter)? {
                // The prior slot already holds an older backup from an
                // interrupted run. That one wins.
                files.savedata_backup.delete_if_exists(&mut self.store)?;
            } else {
                files
                    .savedata_backup
                    .move_to(&files.savedata_prior, &mut self.store)?;
            }
        }

        if !files.savedata.exists() {
            reporter.warning("No save data found; skipping snapshot");
            return Ok(());
        }

        files
            .savedata
            .copy_to(&files.savedata_snapshot, &mut self.store, reporter)?;

        Ok(())
    }

    /// Make sure the backup slot holds the unpatched APK. Returns whether
    /// its contents changed.
    fn acquire_base_apk(
        &mut self,
        update_only: bool,
        updates: &PatchUpdateState,
        reporter: &Reporter,
    ) -> Result<bool> {
        reporter.step("Checking base APK");

        let files = &self.files;

        if !updates.scripts
            && files.signed_apk.verify(&self.store, reporter)?
            && files.apk_backup.verify(&self.store, reporter)?
        {
            debug!("Signed and backup APKs verify; skipping base APK");
            return Ok(false);
        }

        if update_only {
            // The installed APK is the patched one. The original only lives
            // in the backup slot.
            if !files.apk_backup.verify(&self.store, reporter)? {
                return Err(Error::MissingFile(FileRole::ApkBackup));
            }
            return Ok(false);
        }

        let installed_path = self.device.installed_apk(&self.target.package)?;
        let installed = VerifiableFile::from_path(&installed_path, FileRole::InstalledApk);
        let installed_hash = installed.hash(reporter)?;

        let backup_matches = self
            .store
            .get(FileRole::ApkBackup)
            .is_some_and(|h| checksum::hashes_equal(h, &installed_hash));

        if backup_matches && files.apk_backup.verify(&self.store, reporter)? {
            debug!("Backup APK matches installed APK");
            return Ok(false);
        }

        reporter.step("Backing up base APK");
        installed.copy_to(&files.apk_backup, &mut self.store, reporter)?;

        Ok(true)
    }

    fn rewrite_archive(&mut self, signer: &dyn ApkSigner, reporter: &Reporter) -> Result<()> {
        reporter.step("Patching APK");

        let files = &self.files;

        let signed = apk::patch(
            &files.apk_backup.full_path(),
            &files.scripts.full_path(),
            signer,
            &files.signed_apk.full_path(),
            reporter,
        )?;

        // The previous signed APK and its checksum stay valid until the new
        // one is complete.
        files.signed_apk.forget(&mut self.store)?;
        let hash = signed.persist()?;
        files.signed_apk.record(&mut self.store, &hash)?;

        Ok(())
    }

    fn backup_obb(&mut self, reporter: &Reporter) -> Result<()> {
        reporter.step("Checking OBB backup");

        let files = &self.files;

        if files.obb_backup.verify(&self.store, reporter)? {
            return Ok(());
        }

        if !files.installed_obb.exists() {
            return Err(Error::MissingFile(FileRole::InstalledObb));
        }

        reporter.step("Backing up OBB");
        files
            .installed_obb
            .copy_to(&files.obb_backup, &mut self.store, reporter)?;

        Ok(())
    }

    /// Finish a patch run whose app is in its final state. Safe to retry.
    pub(super) fn commit_patch(
        &mut self,
        pending: &PendingStep,
        reporter: &Reporter,
    ) -> Result<()> {
        if pending.obb_download {
            let artifact = pending.obb.as_ref().ok_or_else(|| Error::Internal {
                message: "Pending patch has no OBB to install".into(),
                report: None,
            })?;

            reporter.step("Installing OBB");
            fetch_artifact(
                &mut self.store,
                self.downloader,
                artifact,
                &self.files.installed_obb,
                reporter,
            )?;
        }

        if pending.process_savedata {
            self.restore_savedata_after_patch(reporter)?;
        }

        reporter.step("Finalizing");
        self.store.update(|s| {
            s.patched = true;
            s.versions = pending.versions;
            s.pending = None;
        })?;

        info!("Patch committed: {:?}", pending.versions);

        Ok(())
    }

    /// Put the snapshot back into the reinstalled app. The snapshot then
    /// becomes the save backup, unless an older one was set aside.
    fn restore_savedata_after_patch(&mut self, reporter: &Reporter) -> Result<()> {
        reporter.step("Restoring save data");

        let files = &self.files;

        if files.savedata_snapshot.verify(&self.store, reporter)? {
            files
                .savedata_snapshot
                .copy_to(&files.savedata, &mut self.store, reporter)?;

            if files.savedata_prior.verify(&self.store, reporter)? {
                files.savedata_snapshot.delete_if_exists(&mut self.store)?;
            } else {
                files.savedata_backup.delete_if_exists(&mut self.store)?;
                files
                    .savedata_snapshot
                    .move_to(&files.savedata_backup, &mut self.store)?;
            }
        } else {
            reporter.warning("No save data snapshot to restore");
        }

        self.recover_prior_backup(reporter)?;

        Ok(())
    }

    /// Undo everything a patch run did before its handoff. Committed files
    /// from earlier runs are left alone.
    pub(super) fn rollback_patch(
        &mut self,
        keep_snapshot: bool,
        reporter: &Reporter,
    ) -> Result<()> {
        info!("Rolling back patch");
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

        self.recover_prior_backup(reporter)?;
        self.store.set_pending(None)?;

        Ok(())
    }
}
