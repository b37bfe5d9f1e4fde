use std::collections::BTreeSet;

use rusqlite::{params, OptionalExtension};

use murmur_shared::crypto::SymmetricKey;
use murmur_shared::models::Group;
use murmur_shared::types::{GroupId, UserId};

use crate::database::{conversion_error, Database};
use crate::error::{Result, StoreError};

impl Database {
    /// Insert or replace a group together with its member list.
    pub fn upsert_group(&mut self, group: &Group) -> Result<()> {
        let sealed_key = self.seal(&group.symmetric_key)?;
        let group_id = group.id.to_string();

        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO chat_groups (id, name, sealed_key) VALUES (?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET name = excluded.name, sealed_key = excluded.sealed_key",
            params![group_id, group.name, sealed_key],
        )?;
        tx.execute(
            "DELETE FROM group_members WHERE group_id = ?1",
            params![group_id],
        )?;
        {
            let mut stmt =
                tx.prepare("INSERT INTO group_members (group_id, user_id) VALUES (?1, ?2)")?;
            for member in &group.members {
                stmt.execute(params![group_id, member.to_hex()])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_group(&self, id: &GroupId) -> Result<Option<Group>> {
        let row = self
            .conn()
            .query_row(
                "SELECT name, sealed_key FROM chat_groups WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;

        let Some((name, sealed_key)) = row else {
            return Ok(None);
        };

        let key_bytes = self.unseal(&sealed_key)?;
        let symmetric_key: SymmetricKey = key_bytes
            .as_slice()
            .try_into()
            .map_err(|_| StoreError::Corrupt(format!("group {id} key has wrong length")))?;

        Ok(Some(Group {
            id: *id,
            name,
            symmetric_key,
            members: self.group_members(id)?,
        }))
    }

    pub fn group_members(&self, id: &GroupId) -> Result<BTreeSet<UserId>> {
        let mut stmt = self
            .conn()
            .prepare("SELECT user_id FROM group_members WHERE group_id = ?1")?;
        let rows = stmt.query_map(params![id.to_string()], |row| {
            let hex_id: String = row.get(0)?;
            UserId::from_hex(&hex_id).map_err(|e| conversion_error(0, e))
        })?;

        let mut members = BTreeSet::new();
        for row in rows {
            members.insert(row?);
        }
        Ok(members)
    }

    pub fn list_group_ids(&self) -> Result<Vec<GroupId>> {
        let mut stmt = self.conn().prepare("SELECT id FROM chat_groups ORDER BY name")?;
        let rows = stmt.query_map([], |row| {
            let id: String = row.get(0)?;
            GroupId::parse(&id).map_err(|e| conversion_error(0, e))
        })?;

        let mut ids = Vec::new();
        for row in rows {
            ids.push(row?);
        }
        Ok(ids)
    }
}
