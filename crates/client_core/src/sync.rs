use std::{collections::HashMap, sync::Arc};

use anyhow::{anyhow, Result};
use chrono::Utc;
use shared::{
    domain::{ChangeKind, Contact, ContactKind, GROUP_PREFIX},
    protocol::{
        BatchContactResponse, ContactPageResponse, GroupQuery, MemberQuery, RawContact,
        RawMessage, SyncResponse,
    },
};
use tracing::{debug, error, info, warn};

use crate::{
    events::{Event, EventPayload, MessageEvent},
    Bot,
};

/// The member-detail endpoint rejects large batches; rosters are fetched in
/// chunks of this size and concatenated in order.
const MAX_MEMBERS_PER_FETCH: usize = 50;

impl Bot {
    /// Full contact sync: drain the paginated feed, classify every entry,
    /// batch-fetch all group rosters, reconcile friend/member overlaps and
    /// commit the whole batch atomically.
    pub(crate) async fn sync_contacts(self: &Arc<Self>) -> Result<()> {
        let mut seq = -1i64;
        let mut raw_entries: Vec<RawContact> = Vec::new();
        while seq != 0 {
            if seq == -1 {
                seq = 0;
            }
            let page = self.fetch_contact_page(seq).await?;
            seq = page.seq;
            raw_entries.extend(page.member_list);
        }
        debug!(count = raw_entries.len(), "full contact feed drained");

        let mut contacts: Vec<Contact> = Vec::with_capacity(raw_entries.len());
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut group_names: Vec<String> = Vec::new();
        for raw in &raw_entries {
            let kind = ContactKind::classify(raw.verify_flag, &raw.user_name);
            if kind == ContactKind::Group {
                group_names.push(raw.user_name.clone());
            }
            index.insert(raw.user_name.clone(), contacts.len());
            contacts.push(Contact::from_raw(raw, kind));
        }

        if !group_names.is_empty() {
            let groups = self.fetch_groups(&group_names).await?;
            for raw_group in &groups {
                let mut members = Vec::with_capacity(raw_group.member_list.len());
                for raw_member in &raw_group.member_list {
                    if let Some(&idx) = index.get(&raw_member.user_name) {
                        if matches!(
                            contacts[idx].kind,
                            ContactKind::Friend | ContactKind::FriendAndMember
                        ) {
                            contacts[idx].kind = ContactKind::FriendAndMember;
                        }
                        members.push(contacts[idx].clone());
                    } else {
                        let mut member = Contact::from_raw(raw_member, ContactKind::Member);
                        member.avatar_url =
                            synthesized_avatar_url(&raw_member.user_name, &raw_group.user_name);
                        index.insert(member.user_name.clone(), contacts.len());
                        contacts.push(member.clone());
                        members.push(member);
                    }
                }

                let mut group = Contact::from_raw(raw_group, ContactKind::Group);
                group.members = members;
                match index.get(&group.user_name) {
                    Some(&idx) => contacts[idx] = group,
                    None => {
                        index.insert(group.user_name.clone(), contacts.len());
                        contacts.push(group);
                    }
                }
            }
        }

        self.cache.replace_all(contacts);
        Ok(())
    }

    async fn fetch_contact_page(&self, seq: i64) -> Result<ContactPageResponse> {
        let url = format!(
            "{}/webwxgetcontact?{}&r={}&seq={seq}",
            self.session.base_url().await,
            self.session.credential_query().await,
            Utc::now().timestamp(),
        );
        self.execute_api(&url, None).await
    }

    /// Batched full-group fetch: one call for every requested group, each
    /// answered with its complete member roster.
    async fn fetch_groups(&self, user_names: &[String]) -> Result<Vec<RawContact>> {
        let queries: Vec<GroupQuery> = user_names
            .iter()
            .map(|user_name| GroupQuery {
                user_name: user_name.clone(),
                chat_room_id: String::new(),
            })
            .collect();
        let body = serde_json::json!({
            "BaseRequest": self.session.base_request().await,
            "Count": queries.len(),
            "List": queries,
        });
        let url = format!(
            "{}/webwxbatchgetcontact?type=ex&r={}",
            self.session.base_url().await,
            Utc::now().timestamp_millis(),
        );
        let response: BatchContactResponse = self.execute_api(&url, Some(body)).await?;
        Ok(response.contact_list)
    }

    async fn fetch_members(&self, queries: &[MemberQuery]) -> Result<Vec<RawContact>> {
        let mut members = Vec::with_capacity(queries.len());
        for chunk in queries.chunks(MAX_MEMBERS_PER_FETCH) {
            let body = serde_json::json!({
                "BaseRequest": self.session.base_request().await,
                "Count": chunk.len(),
                "List": chunk,
            });
            let url = format!(
                "{}/webwxbatchgetcontact?type=ex&r={}",
                self.session.base_url().await,
                Utc::now().timestamp_millis(),
            );
            let response: BatchContactResponse = self.execute_api(&url, Some(body)).await?;
            members.extend(response.contact_list);
        }
        Ok(members)
    }

    /// Re-fetch one group's roster and upsert it, promoting members that are
    /// already cached as direct friends. Applies against the current cache
    /// state, not a sync snapshot.
    pub(crate) async fn refresh_group(&self, group_user_name: &str) -> Result<()> {
        debug!(group = %group_user_name, "force updating group");
        let groups = self.fetch_groups(&[group_user_name.to_string()]).await?;
        let raw_group = match groups.as_slice() {
            [raw_group] => raw_group,
            _ => {
                return Err(anyhow!(
                    "expected one group record for {group_user_name}, got {}",
                    groups.len()
                ))
            }
        };

        let queries: Vec<MemberQuery> = raw_group
            .member_list
            .iter()
            .map(|member| MemberQuery {
                user_name: member.user_name.clone(),
                encry_chat_room_id: raw_group.encry_chat_room_id.clone(),
            })
            .collect();
        let details = self.fetch_members(&queries).await?;

        let mut members = Vec::with_capacity(details.len());
        for raw_member in &details {
            let kind = if self.cache.is_friend(&raw_member.user_name) {
                ContactKind::FriendAndMember
            } else {
                ContactKind::Member
            };
            members.push(Contact::from_raw(raw_member, kind));
        }
        for member in &members {
            self.cache.upsert(member.clone());
        }

        let mut group = Contact::from_raw(raw_group, ContactKind::Group);
        group.members = members;
        self.cache.upsert(group);
        Ok(())
    }

    /// On-demand refresh for a group referenced by an incoming message but
    /// not yet cached.
    pub(crate) async fn update_group_if_needed(&self, group_user_name: &str) {
        if self.cache.contains(group_user_name) {
            return;
        }
        if let Err(err) = self.refresh_group(group_user_name).await {
            error!(group = %group_user_name, error = %err, "on-demand group refresh failed");
        }
    }

    /// Apply one contact delta batch from the push feed. Group payloads in
    /// the delta feed are incomplete, so groups go through an asynchronous
    /// roster refresh instead of a direct upsert.
    pub(crate) async fn contact_did_change(
        self: &Arc<Self>,
        records: &[RawContact],
        kind: ChangeKind,
    ) {
        info!(count = records.len(), ?kind, "contact did change, updating local mirror");
        for raw in records {
            if raw.user_name.is_empty() {
                warn!("contact delta without identity, skipped");
                continue;
            }
            match kind {
                ChangeKind::Delete => {
                    self.cache.remove(&raw.user_name);
                    self.bus.emit(Event::new(
                        "/contact/del",
                        "server",
                        EventPayload::ContactChange {
                            kind: ChangeKind::Delete,
                            user_name: raw.user_name.clone(),
                        },
                    ));
                }
                ChangeKind::Modify => {
                    match ContactKind::classify(raw.verify_flag, &raw.user_name) {
                        ContactKind::Group => {
                            let bot = Arc::clone(self);
                            let group = raw.user_name.clone();
                            tokio::spawn(async move {
                                if let Err(err) = bot.refresh_group(&group).await {
                                    error!(%group, error = %err, "group refresh after delta failed");
                                }
                            });
                        }
                        other => self.cache.upsert(Contact::from_raw(raw, other)),
                    }
                    self.bus.emit(Event::new(
                        "/contact/mod",
                        "server",
                        EventPayload::ContactChange {
                            kind: ChangeKind::Modify,
                            user_name: raw.user_name.clone(),
                        },
                    ));
                }
            }
        }
    }

    /// Indefinite long-poll loop. Returns the error that ended it; the
    /// supervised login loop decides what happens next.
    pub(crate) async fn sync_loop(self: &Arc<Self>) -> anyhow::Error {
        info!("entering long-poll sync loop");
        loop {
            let response = match self.pull_updates().await {
                Ok(response) => response,
                Err(err) => return err,
            };
            if !response.sync_key.is_empty() {
                self.session.set_sync_cursor(response.sync_key.clone()).await;
            }
            self.handle_push(response).await;
        }
    }

    async fn pull_updates(&self) -> Result<SyncResponse> {
        let data = self.session.snapshot().await;
        let url = format!(
            "{}/webwxsync?sid={}&skey={}&pass_ticket={}",
            data.base_url,
            data.base_request.sid,
            data.base_request.skey,
            data.base_request.pass_ticket,
        );
        let body = serde_json::json!({
            "BaseRequest": data.base_request,
            "SyncKey": data.sync_cursor,
            "rr": -Utc::now().timestamp(),
        });
        self.execute_api(&url, Some(body)).await
    }

    /// Translate one push batch into cache mutations and bus events.
    pub(crate) async fn handle_push(self: &Arc<Self>, response: SyncResponse) {
        if !response.del_contact_list.is_empty() {
            self.contact_did_change(&response.del_contact_list, ChangeKind::Delete)
                .await;
        }
        if !response.mod_contact_list.is_empty() {
            self.contact_did_change(&response.mod_contact_list, ChangeKind::Modify)
                .await;
        }
        for raw_group in &response.mod_chat_room_member_list {
            if raw_group.user_name.is_empty() {
                continue;
            }
            let bot = Arc::clone(self);
            let group = raw_group.user_name.clone();
            tokio::spawn(async move {
                if let Err(err) = bot.refresh_group(&group).await {
                    error!(%group, error = %err, "group refresh after roster push failed");
                }
            });
        }
        for message in response.add_msg_list {
            self.emit_message_event(message).await;
        }
    }

    /// Derive the routed message event: media URL synthesis, group sender
    /// resolution against the cache, and mentions-me detection.
    pub(crate) async fn emit_message_event(self: &Arc<Self>, raw: RawMessage) {
        let myself = self.session.myself().await;
        let my_user_name = myself
            .as_ref()
            .map(|me| me.user_name.as_str())
            .unwrap_or_default();

        let from = raw.from_user_name.clone();
        let mut sender = from.clone();
        let mut content = raw.content.clone();
        let is_sent_by_self = !my_user_name.is_empty() && from == my_user_name;

        let group_user_name = if from.starts_with(GROUP_PREFIX) {
            Some(from.clone())
        } else if raw.to_user_name.starts_with(GROUP_PREFIX) {
            Some(raw.to_user_name.clone())
        } else {
            None
        };
        let is_group_msg = group_user_name.is_some();
        if let Some(group) = &group_user_name {
            self.update_group_if_needed(group).await;
        }

        let media_path = match raw.msg_type {
            3 => Some("webwxgetmsgimg"),
            47 if raw.has_product_id == 0 => Some("webwxgetmsgimg"),
            34 => Some("webwxgetvoice"),
            43 => Some("webwxgetvideo"),
            _ => None,
        };
        let (is_media_msg, media_url) = match media_path {
            Some(path) => {
                let data = self.session.snapshot().await;
                (
                    true,
                    format!(
                        "{}/{path}?msgid={}&skey={}",
                        data.base_url, raw.msg_id, data.base_request.skey
                    ),
                )
            }
            None => (false, String::new()),
        };

        let mut at_me = false;
        if is_group_msg && !is_sent_by_self {
            if let Some(me) = &myself {
                let name = if me.display_name.is_empty() {
                    &me.nick_name
                } else {
                    &me.display_name
                };
                at_me = content.contains(&format!("@{name}"));
            }

            // Group payloads prefix the content with the speaking member.
            let Some((speaker, rest)) = content.split_once(":<br/>") else {
                debug!(msg_id = %raw.msg_id, "group message without speaker prefix, ignored");
                return;
            };
            match self.cache.lookup(speaker) {
                Some(contact) => {
                    sender = contact.user_name;
                    content = rest.to_string();
                }
                None => {
                    error!(speaker, msg_id = %raw.msg_id, "cannot resolve message sender, message ignored");
                    if let Some(group) = group_user_name {
                        let bot = Arc::clone(self);
                        tokio::spawn(async move {
                            let _ = bot.refresh_group(&group).await;
                        });
                    }
                    return;
                }
            }
        }

        let path = if is_group_msg { "/msg/group" } else { "/msg/solo" };
        let event = MessageEvent {
            is_group_msg,
            is_media_msg,
            is_sent_by_self,
            at_me,
            msg_type: raw.msg_type,
            media_url,
            content,
            from_user_name: from,
            sender_user_name: sender,
            raw,
        };
        self.bus
            .emit(Event::new(path, "server", EventPayload::Message(event)));
    }
}

fn synthesized_avatar_url(member_user_name: &str, group_user_name: &str) -> String {
    format!(
        "/cgi-bin/mmwebwx-bin/webwxgeticon?seq=0&username={member_user_name}&chatroomid={group_user_name}&skey="
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn avatar_url_is_built_from_both_identities() {
        let url = synthesized_avatar_url("member1", "@@room1");
        assert!(url.contains("username=member1"));
        assert!(url.contains("chatroomid=@@room1"));
    }
}
