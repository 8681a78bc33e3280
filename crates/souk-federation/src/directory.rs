//! Seams to the marketplace that federation serves from and delivers to.
//!
//! The federation layer does not own users, postings or chat storage. It
//! reads through [`MarketplaceDirectory`] and delivers through
//! [`ChatInbox`], and strips fields a peer's scopes do not cover before
//! anything leaves the server.

use serde_json::Value;
use souk_types::ScopePermissions;
use std::sync::Mutex;

use crate::types::{
    FederatedPostingSummary, FederatedUserSummary, GeoPoint, NearbyUsersQuery, PostingSearchQuery,
};

/// Read access to local marketplace data for federated queries.
pub trait MarketplaceDirectory: Send + Sync {
    fn nearby_users(&self, query: &NearbyUsersQuery) -> Vec<FederatedUserSummary>;
    fn search_postings(&self, search: &PostingSearchQuery) -> Vec<FederatedPostingSummary>;
}

/// A message relayed in from a federated server, ready for local delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundChatMessage {
    pub message_id: String,
    pub recipient_user_id: String,
    /// `userId@serverId` of the remote sender.
    pub sender_address: String,
    pub sender_name: String,
    pub encrypted_payload: String,
    pub sender_public_key: String,
}

/// Local delivery of relayed chat messages.
pub trait ChatInbox: Send + Sync {
    /// Returns `false` when the recipient does not exist or cannot receive.
    fn deliver(&self, message: InboundChatMessage) -> bool;
}

/// A directory with nothing in it.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyDirectory;

impl MarketplaceDirectory for EmptyDirectory {
    fn nearby_users(&self, _query: &NearbyUsersQuery) -> Vec<FederatedUserSummary> {
        Vec::new()
    }

    fn search_postings(&self, _search: &PostingSearchQuery) -> Vec<FederatedPostingSummary> {
        Vec::new()
    }
}

/// A user known to a [`StaticDirectory`].
#[derive(Debug, Clone, PartialEq)]
pub struct DirectoryUser {
    pub user_id: String,
    pub display_name: String,
    pub location: GeoPoint,
    pub attributes: Option<Value>,
}

/// Fixed in-memory marketplace data.
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    pub users: Vec<DirectoryUser>,
    pub postings: Vec<FederatedPostingSummary>,
}

const EARTH_RADIUS_KM: f64 = 6371.0;

/// Great-circle distance in kilometres.
pub fn haversine_km(a: GeoPoint, b: GeoPoint) -> f64 {
    let (lat1, lat2) = (a.latitude.to_radians(), b.latitude.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (b.longitude - a.longitude).to_radians();
    let h = (d_lat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * h.sqrt().asin()
}

impl MarketplaceDirectory for StaticDirectory {
    fn nearby_users(&self, query: &NearbyUsersQuery) -> Vec<FederatedUserSummary> {
        let origin = GeoPoint {
            latitude: query.latitude,
            longitude: query.longitude,
        };
        let mut found: Vec<(f64, &DirectoryUser)> = self
            .users
            .iter()
            .map(|u| (haversine_km(origin, u.location), u))
            .filter(|(distance, _)| *distance <= query.radius_km)
            .collect();
        found.sort_by(|a, b| a.0.total_cmp(&b.0));
        found
            .into_iter()
            .take(query.limit as usize)
            .map(|(distance, u)| FederatedUserSummary {
                user_id: u.user_id.clone(),
                display_name: u.display_name.clone(),
                distance_km: Some(distance),
                attributes: u.attributes.clone(),
            })
            .collect()
    }

    fn search_postings(&self, search: &PostingSearchQuery) -> Vec<FederatedPostingSummary> {
        let needle = search.query.trim().to_lowercase();
        self.postings
            .iter()
            .filter(|p| {
                needle.is_empty()
                    || p.title.to_lowercase().contains(&needle)
                    || p.description.to_lowercase().contains(&needle)
            })
            .filter(|p| match &search.category {
                Some(category) => p.category.as_deref() == Some(category.as_str()),
                None => true,
            })
            .take(search.limit as usize)
            .cloned()
            .collect()
    }
}

/// Inbox that keeps delivered messages in memory.
#[derive(Debug, Default)]
pub struct MemoryInbox {
    recipients: Option<Vec<String>>,
    delivered: Mutex<Vec<InboundChatMessage>>,
}

impl MemoryInbox {
    /// Accepts messages for any recipient.
    pub fn accept_all() -> Self {
        Self::default()
    }

    /// Accepts messages only for the listed recipients.
    pub fn for_recipients(recipients: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            recipients: Some(recipients.into_iter().map(Into::into).collect()),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn delivered(&self) -> Vec<InboundChatMessage> {
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl ChatInbox for MemoryInbox {
    fn deliver(&self, message: InboundChatMessage) -> bool {
        if let Some(ref recipients) = self.recipients {
            if !recipients.contains(&message.recipient_user_id) {
                return false;
            }
        }
        self.delivered
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(message);
        true
    }
}

/// Strips user fields the peer's scopes do not cover.
pub fn redact_user(mut user: FederatedUserSummary, scopes: &ScopePermissions) -> FederatedUserSummary {
    if !scopes.geolocation {
        user.distance_km = None;
    }
    if !scopes.attributes {
        user.attributes = None;
    }
    user
}

/// Strips posting fields the peer's scopes do not cover.
pub fn redact_posting(
    mut posting: FederatedPostingSummary,
    scopes: &ScopePermissions,
) -> FederatedPostingSummary {
    if !scopes.geolocation {
        posting.location = None;
    }
    if !scopes.attributes {
        posting.attributes = None;
    }
    posting
}
