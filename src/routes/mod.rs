use axum::{
    routing::{delete, get, post, put},
    Router,
};

use crate::handlers::{
    brand_settings, campaigns, contact_lists, dashboard, public, sequences, subscribers, templates,
    webhooks,
};
use crate::middleware::auth::AppState;

pub fn create_routes() -> Router<AppState> {
    Router::new()
        // Campaigns
        .route("/api/campaigns", get(campaigns::list_campaigns))
        .route("/api/campaigns", post(campaigns::create_campaign))
        .route("/api/campaigns/{id}", get(campaigns::get_campaign))
        .route("/api/campaigns/{id}", put(campaigns::update_campaign))
        .route("/api/campaigns/{id}", delete(campaigns::delete_campaign))
        .route("/api/campaigns/{id}/tracking", get(campaigns::campaign_tracking))
        // Sequences
        .route("/api/sequences", get(sequences::list_sequences))
        .route("/api/sequences", post(sequences::create_sequence))
        .route("/api/sequences/{id}", get(sequences::get_sequence))
        .route("/api/sequences/{id}", put(sequences::update_sequence))
        .route("/api/sequences/{id}", delete(sequences::delete_sequence))
        .route("/api/sequences/{id}/enroll", post(sequences::enroll))
        .route("/api/sequences/{id}/subscribers", get(sequences::sequence_subscribers))
        .route("/api/subscribers/{id}/sequences", get(sequences::subscriber_sequences))
        // Subscribers
        .route("/api/subscribers", get(subscribers::list_subscribers))
        .route("/api/subscribers/import", post(subscribers::import_subscribers))
        .route("/api/subscribers/export", get(subscribers::export_subscribers))
        .route("/api/subscribers/{id}", get(subscribers::get_subscriber))
        .route("/api/subscribers/{id}", put(subscribers::update_subscriber))
        // Contact lists
        .route("/api/contact-lists", get(contact_lists::list_contact_lists))
        .route("/api/contact-lists", post(contact_lists::create_contact_list))
        .route("/api/contact-lists/{id}", get(contact_lists::get_contact_list))
        .route("/api/contact-lists/{id}", put(contact_lists::update_contact_list))
        .route("/api/contact-lists/{id}", delete(contact_lists::delete_contact_list))
        .route("/api/contact-lists/{id}/members", get(contact_lists::list_members))
        .route("/api/contact-lists/{id}/members", post(contact_lists::add_member))
        .route(
            "/api/contact-lists/{id}/members/{subscriber_id}",
            delete(contact_lists::remove_member),
        )
        // Brand settings
        .route("/api/brand-settings", get(brand_settings::get_brand_settings))
        .route("/api/brand-settings", put(brand_settings::update_brand_settings))
        // Templates
        .route("/api/templates", get(templates::list_templates))
        .route("/api/templates/preview", post(templates::preview_template))
        .route("/api/templates/test-send", post(templates::test_send))
        // Dashboard and analytics
        .route("/api/dashboard", get(dashboard::get_dashboard))
        .route("/api/analytics/overview", get(dashboard::analytics_overview))
        // Public newsletter surface
        .route("/api/newsletter/subscribe", post(public::subscribe))
        .route("/api/newsletter/confirm/{token}", get(public::confirm))
        .route("/api/newsletter/unsubscribe/{token}", get(public::unsubscribe))
        .route("/api/archive", get(public::archive_index))
        .route("/api/archive/{slug}", get(public::archive_entry))
        .route("/s/{code}", get(public::short_link_redirect))
        // Webhooks
        .route("/api/webhooks/email", post(webhooks::receive_email_webhook))
        // Health check
        .route("/health", get(public::health_check))
        .route("/api/health", get(public::health_check))
}
