use std::collections::HashSet;

use super::{Db, Filter, count, create, delete, get_first, list, save, update};
use crate::model::{App, AppDetail, AppInstall, AppTag, Tag, resource, status};

/// One app scanned from disk together with its versions and tag keys.
#[derive(Clone, Debug, Default)]
pub struct CatalogueEntry {
    pub app: App,
    pub details: Vec<AppDetail>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CatalogueChanges {
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
}

impl Db {
    /// The app an install belongs to.
    pub async fn app_of(&self, install: &AppInstall) -> anyhow::Result<App> {
        self.must(vec![Filter::Id(install.app_id)]).await
    }

    /// Replaces the stored catalogue of `resource_kind` apps with `entries`.
    ///
    /// Apps and versions that vanished are deleted, or marked `takedown` while an install still
    /// uses them.
    pub async fn replace_catalogue(
        &self,
        resource_kind: &'static str,
        entries: Vec<CatalogueEntry>,
    ) -> anyhow::Result<CatalogueChanges> {
        self.tx(move |tx| {
            let mut changes = CatalogueChanges::default();
            let existing = list::<App>(tx, &[Filter::Eq("resource", resource_kind.to_string().into())])?;
            let mut seen = HashSet::new();

            for entry in entries {
                let mut app = entry.app;
                app.resource = resource_kind.to_string();
                match existing.iter().find(|a| a.key == app.key) {
                    Some(old) => {
                        app.id = old.id;
                        save(tx, &mut app)?;
                        changes.updated += 1;
                    }
                    None => {
                        create(tx, &mut app)?;
                        changes.added += 1;
                    }
                }
                seen.insert(app.id);
                sync_details(tx, app.id, entry.details)?;
                sync_tags(tx, app.id, &entry.tags)?;
            }

            for old in existing.iter().filter(|a| !seen.contains(&a.id)) {
                let installs = count::<AppInstall>(tx, &[Filter::AppId(old.id)])?;
                if installs > 0 {
                    update::<App>(tx, old.id, &[("status", status::TAKEDOWN.to_string().into())])?;
                    continue;
                }
                delete::<AppDetail>(tx, &[Filter::AppId(old.id)])?;
                delete::<AppTag>(tx, &[Filter::AppId(old.id)])?;
                delete::<App>(tx, &[Filter::Id(old.id)])?;
                changes.removed += 1;
            }
            Ok(changes)
        })
        .await
    }

    pub async fn local_apps(&self) -> anyhow::Result<Vec<App>> {
        self.list(vec![Filter::Eq("resource", resource::LOCAL.to_string().into())])
            .await
    }
}

fn sync_details(
    conn: &rusqlite::Connection,
    app_id: i64,
    details: Vec<AppDetail>,
) -> anyhow::Result<()> {
    let existing = list::<AppDetail>(conn, &[Filter::AppId(app_id)])?;
    let mut kept = HashSet::new();
    for mut detail in details {
        detail.app_id = app_id;
        if let Some(old) = existing.iter().find(|d| d.version == detail.version) {
            detail.id = old.id;
        }
        save(conn, &mut detail)?;
        kept.insert(detail.id);
    }
    for old in existing.iter().filter(|d| !kept.contains(&d.id)) {
        let used = count::<AppInstall>(conn, &[Filter::Eq("app_detail_id", old.id.into())])?;
        if used > 0 {
            update::<AppDetail>(conn, old.id, &[("status", status::TAKEDOWN.to_string().into())])?;
        } else {
            delete::<AppDetail>(conn, &[Filter::Id(old.id)])?;
        }
    }
    Ok(())
}

fn sync_tags(conn: &rusqlite::Connection, app_id: i64, tags: &[String]) -> anyhow::Result<()> {
    delete::<AppTag>(conn, &[Filter::AppId(app_id)])?;
    for key in tags {
        let tag = match get_first::<Tag>(conn, &[Filter::Key(key.clone())])? {
            Some(tag) => tag,
            None => {
                let mut tag = Tag {
                    key: key.clone(),
                    name: key.clone(),
                    ..Default::default()
                };
                create(conn, &mut tag)?;
                tag
            }
        };
        create(
            conn,
            &mut AppTag {
                app_id,
                tag_id: tag.id,
                ..Default::default()
            },
        )?;
    }
    Ok(())
}
