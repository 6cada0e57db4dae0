//! Link-graph reconciliation.
//!
//! Both endpoints of a relation store each other's id, so a link write fans
//! out to the driving record plus every target whose reverse set changes.
//! Nested link updates fail on an item without a `links` map, hence the
//! existence ladder: update-if-map-exists, create-map-if-absent, then
//! update-if-map-exists again for the writer that lost the creation race.

use std::collections::BTreeSet;

use chrono::Utc;
use futures_util::future::{join3, join_all};
use tessera_core::{
    sort_key, validate_organisation, ChangeRecord, PointKey, RecordRef, StorageError,
    TesseraError, TesseraResult, Timestamp, ValidationError,
};
use tracing::{debug, instrument, warn};

use crate::codec::{self, attr};
use crate::driver::{revision_conflict, LinkOutcome, StorageDriver, TieredDriver};
use crate::kv::{stored_revision, Clause, Condition, Item, ItemKey, KvStore, UpdateAction};

impl<S: KvStore> TieredDriver<S> {
    #[instrument(skip_all, fields(organisation_id = %organisation_id, entity_type = %record.type_name, id = %record.id, target_type = %target_type))]
    pub(crate) async fn reconcile_links(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        target_type: &str,
        desired: &BTreeSet<String>,
    ) -> TesseraResult<LinkOutcome> {
        validate_organisation(organisation_id)?;
        for type_name in [record.type_name.as_str(), target_type] {
            if self.descriptor(type_name)?.is_hashed() {
                return Err(TesseraError::unsupported(
                    type_name,
                    "links are unavailable for hashed types",
                ));
            }
        }
        if record.id.is_empty() || desired.iter().any(String::is_empty) {
            return Err(ValidationError::InvalidValue {
                field: "links".to_string(),
                reason: "link endpoints need non-empty ids".to_string(),
            }
            .into());
        }

        let diff = record.links.diff(target_type, desired);
        let now = Utc::now();

        let removals = join_all(
            diff.to_remove
                .iter()
                .map(|target| self.unlink_target(organisation_id, record, target_type, target, now)),
        );
        let additions = join_all(
            diff.to_add
                .iter()
                .map(|target| self.link_target(organisation_id, record, target_type, target, now)),
        );
        let own = self.write_own_links(organisation_id, record, target_type, desired, now);
        let (removed, added, own) = join3(removals, additions, own).await;

        let image = own?;
        added.into_iter().collect::<TesseraResult<Vec<_>>>()?;
        removed.into_iter().collect::<TesseraResult<Vec<_>>>()?;

        let revision = stored_revision(Some(&image));
        debug!(
            revision,
            added = diff.to_add.len(),
            removed = diff.to_remove.len(),
            "Links reconciled"
        );
        self.publish(ChangeRecord {
            organisation_id: organisation_id.to_string(),
            id: sort_key(&record.type_name, &record.id),
            revision,
            updated_at: now,
            payload: image.get(attr::ITEM).filter(|v| !v.is_null()).cloned(),
        })
        .await;

        Ok(LinkOutcome {
            revision,
            updated_at: now,
            links: record.links.with_type(target_type, desired.clone()),
            added: diff.to_add,
            removed: diff.to_remove,
        })
    }

    /// Replace the driving record's relation, checked against the revision
    /// the caller holds.
    async fn write_own_links(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        target_type: &str,
        desired: &BTreeSet<String>,
        now: Timestamp,
    ) -> TesseraResult<Item> {
        let key = self.item_key(organisation_id, &record.type_name, &record.id)?;
        let held = record.revision;
        let guard = self.guard(organisation_id, record.provenance.as_ref(), held);
        let stamp = [
            UpdateAction::set(attr::REVISION, held + 1),
            UpdateAction::set(attr::UPDATED_AT, codec::timestamp_value(&now)),
        ];

        let mut in_place = vec![if desired.is_empty() {
            UpdateAction::RemoveLinkSet {
                type_name: target_type.to_string(),
            }
        } else {
            UpdateAction::SetLinkSet {
                type_name: target_type.to_string(),
                ids: desired.iter().cloned().collect(),
            }
        }];
        in_place.extend(stamp.iter().cloned());

        let ids: Vec<String> = desired.iter().cloned().collect();
        let mut create = vec![UpdateAction::set(
            attr::LINKS,
            codec::single_link_value(target_type, &ids),
        )];
        create.extend(stamp.iter().cloned());

        let ladder = [
            (&in_place, Clause::LinksExist),
            (&create, Clause::LinksAbsent),
            (&in_place, Clause::LinksExist),
        ];
        let mut last = None;
        for (step, (actions, existence)) in ladder.into_iter().enumerate() {
            let condition = guard.clone().with(existence);
            match self
                .store
                .update(self.active_table(), &key, actions, condition)
                .await
            {
                Ok(image) => return Ok(image),
                Err(StorageError::ConditionFailed { table, current }) => {
                    if !guard.is_satisfied_by(current.as_ref()) {
                        return Err(revision_conflict(
                            &record.type_name,
                            &record.id,
                            held,
                            StorageError::ConditionFailed { table, current },
                        ));
                    }
                    debug!(step, "Link map existence changed underneath; next rung");
                    last = Some(StorageError::ConditionFailed { table, current });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ladder_exhausted(&key, last))
    }

    /// Add the driving record's id to one target's reverse set.
    ///
    /// The target's revision is bumped unconditionally, past the revision
    /// the caller currently sees, so a shadow over an inherited target still
    /// advances by one.
    async fn link_target(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        target_type: &str,
        target_id: &str,
        now: Timestamp,
    ) -> TesseraResult<()> {
        let key = self.item_key(organisation_id, target_type, target_id)?;
        let floor = self.visible_revision(organisation_id, target_type, target_id).await?;
        let bump = UpdateAction::increment_past(attr::REVISION, floor);
        let add = [
            UpdateAction::AddLink {
                type_name: record.type_name.clone(),
                id: record.id.clone(),
            },
            bump.clone(),
        ];
        let create = [
            UpdateAction::set(
                attr::LINKS,
                codec::single_link_value(&record.type_name, std::slice::from_ref(&record.id)),
            ),
            bump,
        ];

        let ladder = [
            (&add[..], Clause::LinksExist),
            (&create[..], Clause::LinksAbsent),
            (&add[..], Clause::LinksExist),
        ];
        let mut last = None;
        for (actions, existence) in ladder {
            match self
                .store
                .update(
                    self.active_table(),
                    &key,
                    actions,
                    Condition::none().with(existence),
                )
                .await
            {
                Ok(image) => {
                    self.publish_target(organisation_id, target_type, target_id, &image, now)
                        .await;
                    return Ok(());
                }
                Err(e @ StorageError::ConditionFailed { .. }) => last = Some(e),
                Err(e) => return Err(e.into()),
            }
        }
        Err(ladder_exhausted(&key, last))
    }

    /// Remove the driving record's id from one target's reverse set. A
    /// target without a links map has nothing to remove.
    async fn unlink_target(
        &self,
        organisation_id: &str,
        record: &RecordRef,
        target_type: &str,
        target_id: &str,
        now: Timestamp,
    ) -> TesseraResult<()> {
        let key = self.item_key(organisation_id, target_type, target_id)?;
        let floor = self.visible_revision(organisation_id, target_type, target_id).await?;
        let actions = [
            UpdateAction::RemoveLink {
                type_name: record.type_name.clone(),
                id: record.id.clone(),
            },
            UpdateAction::increment_past(attr::REVISION, floor),
        ];
        match self
            .store
            .update(
                self.active_table(),
                &key,
                &actions,
                Condition::none().with(Clause::LinksExist),
            )
            .await
        {
            Ok(image) => {
                self.publish_target(organisation_id, target_type, target_id, &image, now)
                    .await;
                Ok(())
            }
            Err(StorageError::ConditionFailed { .. }) => {
                warn!(key = %key, "Reverse link already absent");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Revision of the target as the caller reads it through every tier, 0
    /// when nothing is visible.
    async fn visible_revision(
        &self,
        organisation_id: &str,
        target_type: &str,
        target_id: &str,
    ) -> TesseraResult<u64> {
        let key = PointKey::new(organisation_id, target_type, target_id);
        let found = StorageDriver::get(self, std::slice::from_ref(&key)).await?;
        Ok(found.into_iter().flatten().next().map_or(0, |target| target.revision))
    }

    /// Report a target's bumped revision.
    async fn publish_target(
        &self,
        organisation_id: &str,
        target_type: &str,
        target_id: &str,
        image: &Item,
        now: Timestamp,
    ) {
        self.publish(ChangeRecord {
            organisation_id: organisation_id.to_string(),
            id: sort_key(target_type, target_id),
            revision: stored_revision(Some(image)),
            updated_at: now,
            payload: image.get(attr::ITEM).filter(|v| !v.is_null()).cloned(),
        })
        .await;
    }
}

fn ladder_exhausted(key: &ItemKey, last: Option<StorageError>) -> TesseraError {
    last.map(TesseraError::from).unwrap_or_else(|| {
        StorageError::InvalidUpdate {
            key: key.to_string(),
            reason: "link ladder exhausted".to_string(),
        }
        .into()
    })
}
