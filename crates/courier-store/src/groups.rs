//! CRUD operations for [`Group`] records and their members.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};

use courier_shared::{GroupId, UserId};

use crate::database::{decode_ts, encode_ts, not_found, Database};
use crate::error::{Result, StoreError};
use crate::models::{Group, GroupSettings, GroupType, LastMessage, Member, MemberRole};

impl Database {
    // ------------------------------------------------------------------
    // Create
    // ------------------------------------------------------------------

    /// Insert a group together with its initial members.
    pub fn insert_group(&mut self, group: &Group) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        tx.execute(
            "INSERT INTO groups
                (id, name, description, group_type, created_by, created_at, updated_at,
                 is_active, settings, last_message, case_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                group.id.to_string(),
                group.name,
                group.description,
                group.group_type.as_str(),
                group.created_by.as_str(),
                encode_ts(&group.created_at),
                encode_ts(&group.updated_at),
                group.is_active,
                group.settings.as_ref().map(serde_json::to_string).transpose()?,
                group.last_message.as_ref().map(serde_json::to_string).transpose()?,
                group.case_id,
            ],
        )?;
        for (position, member) in group.members.iter().enumerate() {
            tx.execute(
                "INSERT INTO group_members
                    (group_id, user_id, role, joined_at, is_active, permissions, position)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    group.id.to_string(),
                    member.user_email.as_str(),
                    member.role.as_str(),
                    encode_ts(&member.joined_at),
                    member.is_active,
                    serde_json::to_string(&member.permissions)?,
                    position as i64,
                ],
            )?;
        }
        tx.commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Read
    // ------------------------------------------------------------------

    /// Fetch an active group with all of its members.
    pub fn get_group(&self, id: GroupId) -> Result<Group> {
        load_group(self.conn(), id)
    }

    /// Active groups where `user` is an active member, most recently updated first.
    pub fn groups_for_user(&self, user: &UserId) -> Result<Vec<Group>> {
        let mut stmt = self.conn().prepare(
            "SELECT g.id FROM groups g
             JOIN group_members m ON m.group_id = g.id
             WHERE g.is_active = 1 AND m.user_id = ?1 AND m.is_active = 1
             ORDER BY g.updated_at DESC",
        )?;
        let ids = stmt
            .query_map(params![user.as_str()], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut groups = Vec::with_capacity(ids.len());
        for id in ids {
            groups.push(load_group(self.conn(), GroupId::parse(&id)?)?);
        }
        Ok(groups)
    }

    /// Active members of an active group, in join order.
    pub fn group_members(&self, id: GroupId) -> Result<Vec<Member>> {
        ensure_active(self.conn(), id)?;
        Ok(load_members(self.conn(), id)?
            .into_iter()
            .filter(|m| m.is_active)
            .collect())
    }

    pub fn is_member(&self, id: GroupId, user: &UserId) -> Result<bool> {
        let found = self
            .conn()
            .query_row(
                "SELECT 1 FROM group_members m
                 JOIN groups g ON g.id = m.group_id
                 WHERE m.group_id = ?1 AND m.user_id = ?2
                   AND m.is_active = 1 AND g.is_active = 1",
                params![id.to_string(), user.as_str()],
                |_| Ok(()),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn is_group_admin(&self, id: GroupId, user: &UserId) -> Result<bool> {
        match load_group(self.conn(), id) {
            Ok(group) => Ok(group.is_admin(user)),
            Err(StoreError::NotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Update
    // ------------------------------------------------------------------

    /// Overwrite the editable group fields and return the stored group.
    pub fn update_group(&self, group: &Group) -> Result<Group> {
        let affected = self.conn().execute(
            "UPDATE groups
             SET name = ?2, description = ?3, group_type = ?4, settings = ?5,
                 case_id = ?6, updated_at = ?7
             WHERE id = ?1 AND is_active = 1",
            params![
                group.id.to_string(),
                group.name,
                group.description,
                group.group_type.as_str(),
                group.settings.as_ref().map(serde_json::to_string).transpose()?,
                group.case_id,
                encode_ts(&Utc::now()),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        load_group(self.conn(), group.id)
    }

    /// Add a member, or reactivate an inactive one.
    pub fn upsert_member(&mut self, id: GroupId, member: &Member) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        ensure_active(&tx, id)?;
        let affected = tx.execute(
            "INSERT INTO group_members
                (group_id, user_id, role, joined_at, is_active, permissions, position)
             VALUES (?1, ?2, ?3, ?4, 1, ?5,
                     (SELECT COALESCE(MAX(position) + 1, 0) FROM group_members WHERE group_id = ?1))
             ON CONFLICT (group_id, user_id) DO UPDATE
                SET role = excluded.role,
                    joined_at = excluded.joined_at,
                    permissions = excluded.permissions,
                    is_active = 1
                WHERE group_members.is_active = 0",
            params![
                id.to_string(),
                member.user_email.as_str(),
                member.role.as_str(),
                encode_ts(&member.joined_at),
                serde_json::to_string(&member.permissions)?,
            ],
        )?;
        if affected > 0 {
            touch(&tx, id)?;
        }
        tx.commit()?;
        Ok(())
    }

    /// Flag a member inactive.
    pub fn deactivate_member(&mut self, id: GroupId, user: &UserId) -> Result<()> {
        let tx = self.conn_mut().transaction()?;
        ensure_active(&tx, id)?;
        let affected = tx.execute(
            "UPDATE group_members SET is_active = 0
             WHERE group_id = ?1 AND user_id = ?2 AND is_active = 1",
            params![id.to_string(), user.as_str()],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        touch(&tx, id)?;
        tx.commit()?;
        Ok(())
    }

    pub fn set_last_message(&self, id: GroupId, last: &LastMessage) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE groups SET last_message = ?2, updated_at = ?3
             WHERE id = ?1 AND is_active = 1",
            params![
                id.to_string(),
                serde_json::to_string(last)?,
                encode_ts(&Utc::now()),
            ],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Delete
    // ------------------------------------------------------------------

    /// Soft delete: the row stays for history.
    pub fn soft_delete_group(&self, id: GroupId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE groups SET is_active = 0, updated_at = ?2
             WHERE id = ?1 AND is_active = 1",
            params![id.to_string(), encode_ts(&Utc::now())],
        )?;
        if affected == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub(crate) fn ensure_active(conn: &Connection, id: GroupId) -> Result<()> {
    conn.query_row(
        "SELECT 1 FROM groups WHERE id = ?1 AND is_active = 1",
        params![id.to_string()],
        |_| Ok(()),
    )
    .map_err(not_found)
}

fn touch(conn: &Connection, id: GroupId) -> Result<()> {
    conn.execute(
        "UPDATE groups SET updated_at = ?2 WHERE id = ?1",
        params![id.to_string(), encode_ts(&Utc::now())],
    )?;
    Ok(())
}

struct GroupRow {
    name: String,
    description: String,
    group_type: String,
    created_by: String,
    created_at: String,
    updated_at: String,
    is_active: bool,
    settings: Option<String>,
    last_message: Option<String>,
    case_id: Option<String>,
}

fn load_group(conn: &Connection, id: GroupId) -> Result<Group> {
    let row = conn
        .query_row(
            "SELECT name, description, group_type, created_by, created_at, updated_at,
                    is_active, settings, last_message, case_id
             FROM groups WHERE id = ?1 AND is_active = 1",
            params![id.to_string()],
            |row| {
                Ok(GroupRow {
                    name: row.get(0)?,
                    description: row.get(1)?,
                    group_type: row.get(2)?,
                    created_by: row.get(3)?,
                    created_at: row.get(4)?,
                    updated_at: row.get(5)?,
                    is_active: row.get(6)?,
                    settings: row.get(7)?,
                    last_message: row.get(8)?,
                    case_id: row.get(9)?,
                })
            },
        )
        .map_err(not_found)?;

    Ok(Group {
        id,
        name: row.name,
        description: row.description,
        group_type: GroupType::from_str_lossy(&row.group_type),
        members: load_members(conn, id)?,
        created_by: UserId::new(row.created_by),
        created_at: decode_ts(&row.created_at)?,
        updated_at: decode_ts(&row.updated_at)?,
        is_active: row.is_active,
        settings: row
            .settings
            .as_deref()
            .map(serde_json::from_str::<GroupSettings>)
            .transpose()?,
        last_message: row
            .last_message
            .as_deref()
            .map(serde_json::from_str::<LastMessage>)
            .transpose()?,
        case_id: row.case_id,
    })
}

fn load_members(conn: &Connection, id: GroupId) -> Result<Vec<Member>> {
    let mut stmt = conn.prepare(
        "SELECT user_id, role, joined_at, is_active, permissions
         FROM group_members WHERE group_id = ?1
         ORDER BY position ASC",
    )?;
    let rows = stmt
        .query_map(params![id.to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, bool>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(user, role, joined_at, is_active, permissions)| {
            Ok(Member {
                user_email: UserId::new(user),
                role: MemberRole::from_str_lossy(&role),
                joined_at: decode_ts(&joined_at)?,
                is_active,
                permissions: serde_json::from_str(&permissions)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> UserId {
        UserId::from("alice@example.com")
    }

    fn bob() -> UserId {
        UserId::from("bob@example.com")
    }

    fn db_with_group() -> (Database, Group) {
        let mut db = Database::open_in_memory().unwrap();
        let mut group = Group::new("ops", GroupType::Channel, alice());
        group.settings = Some(GroupSettings {
            is_public: true,
            ..Default::default()
        });
        group.case_id = Some("CASE-7".into());
        db.insert_group(&group).unwrap();
        (db, group)
    }

    #[test]
    fn test_insert_and_load_group() {
        let (db, group) = db_with_group();
        let loaded = db.get_group(group.id).unwrap();
        assert_eq!(loaded, group);
    }

    #[test]
    fn test_member_lifecycle() {
        let (mut db, group) = db_with_group();
        assert!(!db.is_member(group.id, &bob()).unwrap());

        db.upsert_member(group.id, &Member::new(bob(), MemberRole::Member))
            .unwrap();
        assert!(db.is_member(group.id, &bob()).unwrap());
        assert_eq!(db.group_members(group.id).unwrap().len(), 2);
        assert_eq!(db.groups_for_user(&bob()).unwrap().len(), 1);

        db.deactivate_member(group.id, &bob()).unwrap();
        assert!(!db.is_member(group.id, &bob()).unwrap());
        assert!(matches!(
            db.deactivate_member(group.id, &bob()),
            Err(StoreError::NotFound)
        ));

        // Reactivation keeps the original row and join order.
        db.upsert_member(group.id, &Member::new(bob(), MemberRole::Member))
            .unwrap();
        let members = db.group_members(group.id).unwrap();
        assert_eq!(members[1].user_email, bob());
    }

    #[test]
    fn test_soft_delete_hides_group() {
        let (db, group) = db_with_group();
        db.soft_delete_group(group.id).unwrap();
        assert!(matches!(db.get_group(group.id), Err(StoreError::NotFound)));
        assert!(!db.is_member(group.id, &alice()).unwrap());
        assert!(!db.is_group_admin(group.id, &alice()).unwrap());
        assert!(matches!(
            db.soft_delete_group(group.id),
            Err(StoreError::NotFound)
        ));
    }

    #[test]
    fn test_update_group_fields() {
        let (db, mut group) = db_with_group();
        group.name = "ops-renamed".into();
        group.settings = None;
        let updated = db.update_group(&group).unwrap();
        assert_eq!(updated.name, "ops-renamed");
        assert!(updated.settings.is_none());
        assert!(updated.updated_at >= group.updated_at);
    }
}
