use std::{env, sync::Arc};

use crate::extract::{
    encode_message_body, extract_inbound, message_preview, normalize_phone, ExtractError,
    InboundMessage, DEFAULT_BUSINESS_NUMBER,
};
use crate::payments::{
    event_name, gateway_payment_id, payment_link_id, transition_for_event,
    verify_gateway_signature, PaymentTransition, ReconcileOutcome, SignatureCheck,
    GATEWAY_SIGNATURE_HEADER,
};
use crate::session_window::window_for_timestamp;
use crate::types::*;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use bcrypt::{hash, verify, DEFAULT_COST};
use chrono::Utc;
use regex::Regex;
use serde_json::{json, Value};
use sqlx::{postgres::PgPoolOptions, PgPool, Row};
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use uuid::Uuid;

fn now_iso() -> String {
    Utc::now().to_rfc3339()
}

fn normalize_email(value: &str) -> String {
    value.trim().to_ascii_lowercase()
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_else(|_| "postgres".to_string());
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "wacrm".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

fn json_text(value: &Value) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}

fn parse_json_text(value: &str) -> Value {
    serde_json::from_str(value).unwrap_or(Value::Null)
}

fn parse_contact_row(row: sqlx::postgres::PgRow) -> Contact {
    let custom_fields = parse_json_text(&row.get::<String, _>("custom_fields"));
    Contact {
        id: row.get("id"),
        name: row.get("name"),
        phone: row.get("phone"),
        email: row.get("email"),
        tags: serde_json::from_str::<Vec<String>>(&row.get::<String, _>("tags"))
            .unwrap_or_default(),
        custom_fields: if custom_fields.is_object() {
            custom_fields
        } else {
            json!({})
        },
        created_at: row.get("created_at"),
    }
}

fn parse_conversation_row(row: sqlx::postgres::PgRow) -> Conversation {
    Conversation {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        business_number: row.get("business_number"),
        status: row.get("status"),
        last_message: row.get("last_message"),
        last_message_time: row.get("last_message_time"),
        last_incoming_at: row.get("last_incoming_at"),
        unread_count: row.get("unread_count"),
        assigned_agent_id: row.get("assigned_agent_id"),
        assigned_at: row.get("assigned_at"),
        created_at: row.get("created_at"),
    }
}

fn parse_conversation_summary_row(row: sqlx::postgres::PgRow) -> ConversationSummary {
    ConversationSummary {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        contact_name: row.get("contact_name"),
        contact_phone: row.get("contact_phone"),
        business_number: row.get("business_number"),
        status: row.get("status"),
        last_message: row.get("last_message"),
        last_message_time: row.get("last_message_time"),
        last_incoming_at: row.get("last_incoming_at"),
        unread_count: row.get("unread_count"),
        assigned_agent_id: row.get("assigned_agent_id"),
        assigned_at: row.get("assigned_at"),
        created_at: row.get("created_at"),
    }
}

fn parse_message_row(row: sqlx::postgres::PgRow) -> ChatMessage {
    ChatMessage {
        id: row.get("id"),
        conversation_id: row.get("conversation_id"),
        direction: row.get("direction"),
        content_type: row.get("content_type"),
        body: row.get("body"),
        media_url: row.get("media_url"),
        file_name: row.get("file_name"),
        status: row.get("status"),
        is_note: row.get("is_note"),
        external_id: row.get("external_id"),
        created_at: row.get("created_at"),
    }
}

fn parse_template_row(row: sqlx::postgres::PgRow) -> MessageTemplate {
    MessageTemplate {
        id: row.get("id"),
        name: row.get("name"),
        language: row.get("language"),
        category: row.get("category"),
        body: row.get("body"),
        created_at: row.get("created_at"),
    }
}

fn parse_payment_row(row: sqlx::postgres::PgRow) -> Payment {
    Payment {
        id: row.get("id"),
        contact_id: row.get("contact_id"),
        conversation_id: row.get("conversation_id"),
        contact_name: row.get("contact_name"),
        contact_phone: row.get("contact_phone"),
        amount: row.get("amount"),
        currency: row.get("currency"),
        description: row.get("description"),
        razorpay_link_id: row.get("razorpay_link_id"),
        razorpay_payment_id: row.get("razorpay_payment_id"),
        short_url: row.get("short_url"),
        message_status: row.get("message_status"),
        status: row.get("status"),
        created_by: row.get("created_by"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

/// Fill positional `{{n}}` slots with 1-indexed params. Slots without a
/// matching param are left verbatim.
fn render_template_body(body: &str, params: &[String]) -> String {
    let Ok(re) = Regex::new(r"\{\{(\d+)\}\}") else {
        return body.to_string();
    };
    re.replace_all(body, |caps: &regex::Captures| {
        let idx = caps
            .get(1)
            .and_then(|m| m.as_str().parse::<usize>().ok())
            .unwrap_or(0);
        if idx == 0 {
            return caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string();
        }
        params
            .get(idx - 1)
            .cloned()
            .unwrap_or_else(|| caps.get(0).map(|m| m.as_str()).unwrap_or("").to_string())
    })
    .to_string()
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let token = header.strip_prefix("Bearer ")?;
    Some(token.trim().to_string())
}

async fn auth_agent_from_headers(
    state: &Arc<AppState>,
    headers: &HeaderMap,
) -> Result<AgentProfile, (StatusCode, Json<Value>)> {
    let token = bearer_token(headers).ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "missing bearer token" })),
    ))?;

    let row = sqlx::query(
        "SELECT a.id, a.name, a.email, a.role FROM auth_tokens t JOIN agents a ON a.id = t.agent_id WHERE t.token = $1",
    )
    .bind(&token)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()
    .ok_or((
        StatusCode::UNAUTHORIZED,
        Json(json!({ "error": "invalid token" })),
    ))?;

    Ok(AgentProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        role: row.get("role"),
    })
}

async fn issue_auth_token(state: &Arc<AppState>, agent_id: &str) -> Option<String> {
    let token = Uuid::new_v4().to_string();
    let inserted = sqlx::query(
        "INSERT INTO auth_tokens (token, agent_id, created_at) VALUES ($1,$2,$3)",
    )
    .bind(&token)
    .bind(agent_id)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();
    if inserted {
        Some(token)
    } else {
        None
    }
}

// Inbound ingestion pipeline

async fn find_or_create_contact(
    state: &Arc<AppState>,
    phone: &str,
    display_name_hint: &str,
) -> Result<Contact, sqlx::Error> {
    let existing = sqlx::query(
        "SELECT id, name, phone, email, tags, custom_fields, created_at FROM contacts WHERE phone = $1 ORDER BY created_at ASC LIMIT 1",
    )
    .bind(phone)
    .fetch_optional(&state.db)
    .await?;

    let hint = display_name_hint.trim();
    if let Some(row) = existing {
        let mut contact = parse_contact_row(row);
        // A real display name, once seen, wins. The provider profile name only
        // fills in while the stored name is still the bare-number placeholder.
        if !hint.is_empty()
            && hint != contact.name
            && (contact.name.is_empty() || contact.name == contact.phone)
        {
            sqlx::query("UPDATE contacts SET name = $1 WHERE id = $2")
                .bind(hint)
                .bind(&contact.id)
                .execute(&state.db)
                .await?;
            contact.name = hint.to_string();
        }
        return Ok(contact);
    }

    let contact = Contact {
        id: Uuid::new_v4().to_string(),
        name: if hint.is_empty() {
            phone.to_string()
        } else {
            hint.to_string()
        },
        phone: phone.to_string(),
        email: String::new(),
        tags: vec![],
        custom_fields: json!({}),
        created_at: now_iso(),
    };
    sqlx::query(
        "INSERT INTO contacts (id, name, phone, email, tags, custom_fields, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&contact.id)
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.email)
    .bind(json_text(&json!(contact.tags)))
    .bind(json_text(&contact.custom_fields))
    .bind(&contact.created_at)
    .execute(&state.db)
    .await?;
    Ok(contact)
}

async fn find_or_create_conversation(
    state: &Arc<AppState>,
    contact_id: &str,
    business_number: &str,
    preview: &str,
) -> Result<String, sqlx::Error> {
    let existing = sqlx::query_scalar::<_, String>(
        "SELECT id FROM conversations WHERE contact_id = $1 AND business_number = $2 ORDER BY created_at ASC LIMIT 1",
    )
    .bind(contact_id)
    .bind(business_number)
    .fetch_optional(&state.db)
    .await?;

    let now = now_iso();
    if let Some(conversation_id) = existing {
        // Any inbound activity reopens the thread. The unread increment is a
        // single expression so concurrent deliveries cannot lose counts.
        sqlx::query(
            "UPDATE conversations SET status = 'open', last_message = $1, last_message_time = $2, last_incoming_at = $2, unread_count = unread_count + 1 WHERE id = $3",
        )
        .bind(preview)
        .bind(&now)
        .bind(&conversation_id)
        .execute(&state.db)
        .await?;
        return Ok(conversation_id);
    }

    let conversation_id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO conversations (id, contact_id, business_number, status, last_message, last_message_time, last_incoming_at, unread_count, assigned_agent_id, assigned_at, created_at) \
         VALUES ($1,$2,$3,'open',$4,$5,$5,1,NULL,'',$5)",
    )
    .bind(&conversation_id)
    .bind(contact_id)
    .bind(business_number)
    .bind(preview)
    .bind(&now)
    .execute(&state.db)
    .await?;
    Ok(conversation_id)
}

async fn insert_message_row(pool: &PgPool, message: &ChatMessage) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO messages (id, conversation_id, direction, content_type, body, media_url, file_name, status, is_note, external_id, created_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11) ON CONFLICT (id) DO NOTHING",
    )
    .bind(&message.id)
    .bind(&message.conversation_id)
    .bind(&message.direction)
    .bind(&message.content_type)
    .bind(&message.body)
    .bind(&message.media_url)
    .bind(&message.file_name)
    .bind(&message.status)
    .bind(message.is_note)
    .bind(&message.external_id)
    .bind(&message.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_inbound_message(
    state: &Arc<AppState>,
    conversation_id: &str,
    inbound: &InboundMessage,
) -> Result<ChatMessage, sqlx::Error> {
    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        direction: "inbound".to_string(),
        content_type: inbound.content_type.clone(),
        body: encode_message_body(inbound),
        media_url: inbound.media_url.clone(),
        file_name: inbound.file_name.clone(),
        // no delivery semantics apply to a message we already hold
        status: "delivered".to_string(),
        is_note: false,
        external_id: inbound.external_id.clone(),
        created_at: now_iso(),
    };
    insert_message_row(&state.db, &message).await?;
    Ok(message)
}

struct IngestOutcome {
    conversation_id: String,
    contact_id: String,
}

async fn ingest_inbound_message(
    state: &Arc<AppState>,
    inbound: &InboundMessage,
) -> Result<IngestOutcome, sqlx::Error> {
    let contact = find_or_create_contact(state, &inbound.sender_phone, &inbound.sender_name).await?;
    let preview = message_preview(&inbound.body_text);
    let conversation_id =
        find_or_create_conversation(state, &contact.id, &inbound.receiver_number, &preview).await?;
    insert_inbound_message(state, &conversation_id, inbound).await?;
    Ok(IngestOutcome {
        conversation_id,
        contact_id: contact.id,
    })
}

async fn whatsapp_webhook_event(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let inbound = match extract_inbound(&payload) {
        Ok(inbound) => inbound,
        Err(ExtractError::MissingSenderPhone) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "No sender phone found in webhook payload" })),
            )
                .into_response();
        }
    };

    match ingest_inbound_message(&state, &inbound).await {
        Ok(outcome) => {
            info!(
                conversation_id = %outcome.conversation_id,
                contact_id = %outcome.contact_id,
                content_type = %inbound.content_type,
                "inbound message ingested"
            );
            (
                StatusCode::OK,
                Json(json!({ "success": true, "conversationId": outcome.conversation_id })),
            )
                .into_response()
        }
        Err(err) => {
            // Partial writes stand; the provider's redelivery resumes from the
            // rows that already exist.
            error!(error = %err, sender = %inbound.sender_phone, "inbound webhook persistence failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": err.to_string() })),
            )
                .into_response()
        }
    }
}

// Payment gateway webhook

async fn reconcile_gateway_event(state: &Arc<AppState>, payload: &Value) -> ReconcileOutcome {
    let event = event_name(payload);
    let Some(transition) = transition_for_event(&event) else {
        return ReconcileOutcome::Ignored {
            reason: format!("unhandled event '{event}'"),
        };
    };
    let Some(link_id) = payment_link_id(payload) else {
        return ReconcileOutcome::Ignored {
            reason: "missing payment link id".to_string(),
        };
    };

    let now = now_iso();
    let result = match transition {
        PaymentTransition::Paid => {
            let payment_id = gateway_payment_id(payload).unwrap_or_default();
            sqlx::query(
                "UPDATE payments SET status = 'paid', updated_at = $1, \
                 razorpay_payment_id = CASE WHEN razorpay_payment_id = '' THEN $2 ELSE razorpay_payment_id END \
                 WHERE razorpay_link_id = $3 AND status IN ('created', 'unpaid', 'paid')",
            )
            .bind(&now)
            .bind(&payment_id)
            .bind(&link_id)
            .execute(&state.db)
            .await
        }
        PaymentTransition::Cancelled | PaymentTransition::Expired => {
            // re-applying the same terminal status is allowed (replay); moving
            // between terminal statuses is not
            sqlx::query(
                "UPDATE payments SET status = $1, updated_at = $2 \
                 WHERE razorpay_link_id = $3 AND status IN ('created', 'unpaid', $1)",
            )
            .bind(transition.status())
            .bind(&now)
            .bind(&link_id)
            .execute(&state.db)
            .await
        }
    };

    match result {
        Ok(done) if done.rows_affected() > 0 => ReconcileOutcome::Applied {
            link_id,
            status: transition.status(),
        },
        Ok(_) => ReconcileOutcome::Ignored {
            reason: format!("no matching payment for link '{link_id}'"),
        },
        Err(err) => {
            error!(error = %err, link_id = %link_id, "payment reconcile query failed");
            ReconcileOutcome::Ignored {
                reason: "datastore error".to_string(),
            }
        }
    }
}

async fn razorpay_webhook_event(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    let signature_header = headers
        .get(GATEWAY_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok());
    match verify_gateway_signature(&state.razorpay_webhook_secret, signature_header, &body) {
        SignatureCheck::Invalid => {
            warn!("payment webhook rejected: signature mismatch");
            return (
                StatusCode::UNAUTHORIZED,
                Json(json!({ "error": "Invalid signature" })),
            )
                .into_response();
        }
        SignatureCheck::Skipped => {
            warn!("payment webhook accepted without signature verification");
        }
        SignatureCheck::Valid => {}
    }

    let payload = serde_json::from_slice::<Value>(&body).unwrap_or_else(|_| json!({}));
    match reconcile_gateway_event(&state, &payload).await {
        ReconcileOutcome::Applied { link_id, status } => {
            info!(link_id = %link_id, status = %status, "payment transition applied");
        }
        ReconcileOutcome::Ignored { reason } => {
            info!(reason = %reason, "payment webhook acknowledged without changes");
        }
    }

    // The gateway retries on anything but success, so unmatched or unhandled
    // events are still acknowledged.
    (StatusCode::OK, Json(json!({ "status": "ok" }))).into_response()
}

// WhatsApp provider client

async fn send_whatsapp_request(state: &Arc<AppState>, payload: &Value) -> Result<Value, Value> {
    if state.whatsapp_api_url.is_empty() || state.whatsapp_api_token.is_empty() {
        return Err(json!({
            "statusCode": 0,
            "statusText": "CONFIG_ERROR",
            "rawBody": "missing WHATSAPP_API_URL or WHATSAPP_API_TOKEN",
            "body": { "error": "missing WHATSAPP_API_URL or WHATSAPP_API_TOKEN" }
        }));
    }

    let response = state
        .http_client
        .post(format!(
            "{}/messages",
            state.whatsapp_api_url.trim_end_matches('/')
        ))
        .bearer_auth(&state.whatsapp_api_token)
        .json(payload)
        .send()
        .await
        .map_err(|e| {
            json!({
                "statusCode": 0,
                "statusText": "REQUEST_ERROR",
                "rawBody": e.to_string(),
                "body": { "error": e.to_string() }
            })
        })?;

    let status = response.status();
    let raw_body = response.text().await.unwrap_or_default();
    let body =
        serde_json::from_str::<Value>(&raw_body).unwrap_or_else(|_| json!({ "raw": raw_body }));
    let result = json!({
        "statusCode": status.as_u16(),
        "statusText": status.to_string(),
        "rawBody": raw_body,
        "body": body
    });

    if status.is_success() {
        return Ok(result);
    }
    Err(result)
}

fn outbound_message_payload(to: &str, business_number: &str, message: &ChatMessage) -> Value {
    let mut payload = json!({ "from": business_number, "to": to });
    match message.content_type.as_str() {
        "image" => {
            payload["type"] = json!("image");
            payload["image"] = json!({ "link": message.media_url, "caption": message.body });
        }
        "document" => {
            let filename = if message.file_name.is_empty() {
                "attachment"
            } else {
                message.file_name.as_str()
            };
            payload["type"] = json!("document");
            payload["document"] = json!({
                "link": message.media_url,
                "filename": filename,
                "caption": message.body
            });
        }
        _ => {
            payload["type"] = json!("text");
            payload["text"] = json!({ "preview_url": false, "body": message.body });
        }
    }
    payload
}

fn template_message_payload(
    to: &str,
    business_number: &str,
    template: &MessageTemplate,
    params: &[String],
) -> Value {
    let mut payload = json!({
        "from": business_number,
        "to": to,
        "type": "template",
        "template": {
            "name": template.name,
            "language": { "code": template.language }
        }
    });
    if !params.is_empty() {
        let parameters = params
            .iter()
            .map(|p| json!({ "type": "text", "text": p }))
            .collect::<Vec<_>>();
        payload["template"]["components"] =
            json!([{ "type": "body", "parameters": parameters }]);
    }
    payload
}

async fn deliver_and_mark(state: Arc<AppState>, message_id: String, payload: Value) {
    let status = match send_whatsapp_request(&state, &payload).await {
        Ok(_) => "sent",
        Err(result) => {
            error!(message_id = %message_id, result = %result, "outbound whatsapp delivery failed");
            "failed"
        }
    };
    let _ = sqlx::query("UPDATE messages SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(&message_id)
        .execute(&state.db)
        .await;
}

async fn deliver_payment_link(
    state: Arc<AppState>,
    message_id: String,
    payment_id: String,
    payload: Value,
) {
    let status = match send_whatsapp_request(&state, &payload).await {
        Ok(_) => "sent",
        Err(result) => {
            error!(payment_id = %payment_id, result = %result, "payment link delivery failed");
            "failed"
        }
    };
    let _ = sqlx::query("UPDATE messages SET status = $1 WHERE id = $2")
        .bind(status)
        .bind(&message_id)
        .execute(&state.db)
        .await;
    let _ = sqlx::query("UPDATE payments SET message_status = $1, updated_at = $2 WHERE id = $3")
        .bind(status)
        .bind(now_iso())
        .bind(&payment_id)
        .execute(&state.db)
        .await;
}

// Razorpay client

async fn create_razorpay_payment_link(
    state: &Arc<AppState>,
    amount: i64,
    currency: &str,
    description: &str,
    customer_name: &str,
    customer_phone: &str,
) -> Result<Value, String> {
    if state.razorpay_key_id.is_empty() || state.razorpay_key_secret.is_empty() {
        return Err("missing razorpay api credentials".to_string());
    }

    let mut payload = json!({
        "amount": amount,
        "currency": currency,
        "description": description,
        "notify": { "sms": false, "email": false },
        "reminder_enable": false
    });
    if !customer_name.is_empty() || !customer_phone.is_empty() {
        payload["customer"] = json!({ "name": customer_name, "contact": customer_phone });
    }

    let response = state
        .http_client
        .post("https://api.razorpay.com/v1/payment_links")
        .basic_auth(&state.razorpay_key_id, Some(&state.razorpay_key_secret))
        .json(&payload)
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let status = response.status();
    let body = response
        .json::<Value>()
        .await
        .unwrap_or_else(|_| json!({}));
    if !status.is_success() {
        let detail = body
            .pointer("/error/description")
            .and_then(Value::as_str)
            .unwrap_or("payment link request failed");
        return Err(format!("razorpay: {detail} (status {status})"));
    }
    Ok(body)
}

// Auth

async fn signup_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SignupBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    if email.is_empty() || body.password.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "email and password are required" })),
        )
            .into_response();
    }

    let existing = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE email = $1")
        .bind(&email)
        .fetch_one(&state.db)
        .await
        .unwrap_or(0);
    if existing > 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "email already registered" })),
        )
            .into_response();
    }

    let Ok(password_hash) = hash(&body.password, DEFAULT_COST) else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to hash password" })),
        )
            .into_response();
    };

    let agent_count = sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents")
        .fetch_one(&state.db)
        .await
        .unwrap_or(0);
    let profile = AgentProfile {
        id: Uuid::new_v4().to_string(),
        name: body.name.trim().to_string(),
        email: email.clone(),
        role: if agent_count == 0 { "admin" } else { "agent" }.to_string(),
    };

    let inserted = sqlx::query(
        "INSERT INTO agents (id, name, email, password_hash, role, created_at) VALUES ($1,$2,$3,$4,$5,$6)",
    )
    .bind(&profile.id)
    .bind(&profile.name)
    .bind(&profile.email)
    .bind(&password_hash)
    .bind(&profile.role)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();
    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create agent" })),
        )
            .into_response();
    }

    let Some(token) = issue_auth_token(&state, &profile.id).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create auth token" })),
        )
            .into_response();
    };
    (
        StatusCode::CREATED,
        Json(json!({ "token": token, "agent": profile })),
    )
        .into_response()
}

async fn login_agent(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LoginBody>,
) -> impl IntoResponse {
    let email = normalize_email(&body.email);
    let row = sqlx::query(
        "SELECT id, name, email, role, password_hash FROM agents WHERE email = $1",
    )
    .bind(&email)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();

    let Some(row) = row else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    };
    let password_hash: String = row.get("password_hash");
    let valid = verify(&body.password, &password_hash).unwrap_or(false);
    if !valid {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "invalid credentials" })),
        )
            .into_response();
    }

    let profile = AgentProfile {
        id: row.get("id"),
        name: row.get("name"),
        email: row.get("email"),
        role: row.get("role"),
    };
    let _ = sqlx::query("UPDATE agents SET last_login_at = $1 WHERE id = $2")
        .bind(now_iso())
        .bind(&profile.id)
        .execute(&state.db)
        .await;

    let Some(token) = issue_auth_token(&state, &profile.id).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create auth token" })),
        )
            .into_response();
    };
    (
        StatusCode::OK,
        Json(json!({ "token": token, "agent": profile })),
    )
        .into_response()
}

async fn get_me(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => (StatusCode::OK, Json(json!({ "agent": profile }))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn get_agents(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query("SELECT id, name, email, role FROM agents ORDER BY created_at ASC")
        .fetch_all(&state.db)
        .await
        .unwrap_or_default();
    let agents = rows
        .into_iter()
        .map(|row| AgentProfile {
            id: row.get("id"),
            name: row.get("name"),
            email: row.get("email"),
            role: row.get("role"),
        })
        .collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "agents": agents }))).into_response()
}

// Contacts

async fn get_contacts(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT id, name, phone, email, tags, custom_fields, created_at FROM contacts ORDER BY created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let contacts = rows.into_iter().map(parse_contact_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "contacts": contacts }))).into_response()
}

async fn create_contact(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateContactBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let phone = normalize_phone(&body.phone);
    if phone.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "phone is required" })),
        )
            .into_response();
    }

    let custom_fields = body.custom_fields.filter(|v| v.is_object()).unwrap_or_else(|| json!({}));
    let contact = Contact {
        id: Uuid::new_v4().to_string(),
        name: if body.name.trim().is_empty() {
            phone.clone()
        } else {
            body.name.trim().to_string()
        },
        phone,
        email: normalize_email(&body.email),
        tags: body.tags,
        custom_fields,
        created_at: now_iso(),
    };
    let inserted = sqlx::query(
        "INSERT INTO contacts (id, name, phone, email, tags, custom_fields, created_at) VALUES ($1,$2,$3,$4,$5,$6,$7)",
    )
    .bind(&contact.id)
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.email)
    .bind(json_text(&json!(contact.tags)))
    .bind(json_text(&contact.custom_fields))
    .bind(&contact.created_at)
    .execute(&state.db)
    .await
    .is_ok();
    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create contact" })),
        )
            .into_response();
    }
    (StatusCode::CREATED, Json(json!({ "contact": contact }))).into_response()
}

async fn get_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let row = sqlx::query(
        "SELECT id, name, phone, email, tags, custom_fields, created_at FROM contacts WHERE id = $1",
    )
    .bind(&contact_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "contact not found" })),
        )
            .into_response();
    };
    (
        StatusCode::OK,
        Json(json!({ "contact": parse_contact_row(row) })),
    )
        .into_response()
}

async fn patch_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchContactBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let row = sqlx::query(
        "SELECT id, name, phone, email, tags, custom_fields, created_at FROM contacts WHERE id = $1",
    )
    .bind(&contact_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "contact not found" })),
        )
            .into_response();
    };
    let mut contact = parse_contact_row(row);

    if let Some(v) = body.name {
        contact.name = v.trim().to_string();
    }
    if let Some(v) = body.phone {
        let phone = normalize_phone(&v);
        if phone.is_empty() {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "phone cannot be empty" })),
            )
                .into_response();
        }
        contact.phone = phone;
    }
    if let Some(v) = body.email {
        contact.email = normalize_email(&v);
    }
    if let Some(v) = body.tags {
        contact.tags = v;
    }
    if let Some(v) = body.custom_fields {
        if v.is_object() {
            contact.custom_fields = v;
        }
    }

    let updated = sqlx::query(
        "UPDATE contacts SET name = $1, phone = $2, email = $3, tags = $4, custom_fields = $5 WHERE id = $6",
    )
    .bind(&contact.name)
    .bind(&contact.phone)
    .bind(&contact.email)
    .bind(json_text(&json!(contact.tags)))
    .bind(json_text(&contact.custom_fields))
    .bind(&contact.id)
    .execute(&state.db)
    .await
    .is_ok();
    if !updated {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to update contact" })),
        )
            .into_response();
    }
    (StatusCode::OK, Json(json!({ "contact": contact }))).into_response()
}

async fn delete_contact(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let _ = sqlx::query("DELETE FROM contacts WHERE id = $1")
        .bind(&contact_id)
        .execute(&state.db)
        .await;
    (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
}

async fn get_contact_conversations(
    Path(contact_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT v.id, v.contact_id, v.business_number, v.status, v.last_message, v.last_message_time, v.last_incoming_at, v.unread_count, v.assigned_agent_id, v.assigned_at, v.created_at, \
                c.name AS contact_name, c.phone AS contact_phone \
         FROM conversations v JOIN contacts c ON c.id = v.contact_id \
         WHERE v.contact_id = $1 \
         ORDER BY v.last_message_time DESC, v.created_at DESC",
    )
    .bind(&contact_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let conversations = rows
        .into_iter()
        .map(parse_conversation_summary_row)
        .collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "conversations": conversations })),
    )
        .into_response()
}

// Conversations

async fn find_conversation_by_id(state: &Arc<AppState>, conversation_id: &str) -> Option<Conversation> {
    let row = sqlx::query(
        "SELECT id, contact_id, business_number, status, last_message, last_message_time, last_incoming_at, unread_count, assigned_agent_id, assigned_at, created_at FROM conversations WHERE id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(parse_conversation_row(row))
}

async fn conversation_summary(
    state: &Arc<AppState>,
    conversation_id: &str,
) -> Option<ConversationSummary> {
    let row = sqlx::query(
        "SELECT v.id, v.contact_id, v.business_number, v.status, v.last_message, v.last_message_time, v.last_incoming_at, v.unread_count, v.assigned_agent_id, v.assigned_at, v.created_at, \
                c.name AS contact_name, c.phone AS contact_phone \
         FROM conversations v JOIN contacts c ON c.id = v.contact_id \
         WHERE v.id = $1",
    )
    .bind(conversation_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten()?;
    Some(parse_conversation_summary_row(row))
}

async fn contact_phone(state: &Arc<AppState>, contact_id: &str) -> Option<String> {
    sqlx::query_scalar::<_, String>("SELECT phone FROM contacts WHERE id = $1")
        .bind(contact_id)
        .fetch_optional(&state.db)
        .await
        .ok()
        .flatten()
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
}

async fn get_conversations(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT v.id, v.contact_id, v.business_number, v.status, v.last_message, v.last_message_time, v.last_incoming_at, v.unread_count, v.assigned_agent_id, v.assigned_at, v.created_at, \
                c.name AS contact_name, c.phone AS contact_phone \
         FROM conversations v JOIN contacts c ON c.id = v.contact_id \
         ORDER BY v.last_message_time DESC, v.created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let conversations = rows
        .into_iter()
        .map(parse_conversation_summary_row)
        .collect::<Vec<_>>();
    (
        StatusCode::OK,
        Json(json!({ "conversations": conversations })),
    )
        .into_response()
}

async fn open_conversation(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<OpenConversationBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }

    let contact_exists =
        sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM contacts WHERE id = $1")
            .bind(&body.contact_id)
            .fetch_one(&state.db)
            .await
            .unwrap_or(0)
            > 0;
    if !contact_exists {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "contact not found" })),
        )
            .into_response();
    }

    let business_number = {
        let normalized = normalize_phone(&body.business_number);
        if normalized.is_empty() {
            DEFAULT_BUSINESS_NUMBER.to_string()
        } else {
            normalized
        }
    };

    let existing = sqlx::query_scalar::<_, String>(
        "SELECT id FROM conversations WHERE contact_id = $1 AND business_number = $2 ORDER BY created_at ASC LIMIT 1",
    )
    .bind(&body.contact_id)
    .bind(&business_number)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    if let Some(conversation_id) = existing {
        let Some(summary) = conversation_summary(&state, &conversation_id).await else {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load conversation" })),
            )
                .into_response();
        };
        return (StatusCode::OK, Json(json!({ "conversation": summary }))).into_response();
    }

    // Agent-opened threads start quiet: nothing unread, no customer window.
    let conversation_id = Uuid::new_v4().to_string();
    let created = sqlx::query(
        "INSERT INTO conversations (id, contact_id, business_number, status, last_message, last_message_time, last_incoming_at, unread_count, assigned_agent_id, assigned_at, created_at) \
         VALUES ($1,$2,$3,'open','','','',0,NULL,'',$4)",
    )
    .bind(&conversation_id)
    .bind(&body.contact_id)
    .bind(&business_number)
    .bind(now_iso())
    .execute(&state.db)
    .await
    .is_ok();
    if !created {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to create conversation" })),
        )
            .into_response();
    }
    let Some(summary) = conversation_summary(&state, &conversation_id).await else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to load conversation" })),
        )
            .into_response();
    };
    (StatusCode::CREATED, Json(json!({ "conversation": summary }))).into_response()
}

async fn get_conversation(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let Some(summary) = conversation_summary(&state, &conversation_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };
    let session_window = window_for_timestamp(&summary.last_incoming_at, Utc::now());
    (
        StatusCode::OK,
        Json(json!({ "conversation": summary, "sessionWindow": session_window })),
    )
        .into_response()
}

async fn mark_conversation_read(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query("UPDATE conversations SET unread_count = 0 WHERE id = $1")
        .bind(&conversation_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn patch_conversation_status(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchConversationStatusBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let status = body.status.trim().to_ascii_lowercase();
    if status != "open" && status != "resolved" {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "status must be 'open' or 'resolved'" })),
        )
            .into_response();
    }
    let result = sqlx::query("UPDATE conversations SET status = $1 WHERE id = $2")
        .bind(&status)
        .bind(&conversation_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            let Some(summary) = conversation_summary(&state, &conversation_id).await else {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed to load conversation" })),
                )
                    .into_response();
            };
            (StatusCode::OK, Json(json!({ "conversation": summary }))).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn patch_conversation_assignee(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<PatchConversationAssigneeBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }

    let agent_id = body
        .agent_id
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());
    if let Some(ref agent_id) = agent_id {
        let agent_exists =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(1) FROM agents WHERE id = $1")
                .bind(agent_id)
                .fetch_one(&state.db)
                .await
                .unwrap_or(0)
                > 0;
        if !agent_exists {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "agent not found" })),
            )
                .into_response();
        }
    }

    let assigned_at = if agent_id.is_some() {
        now_iso()
    } else {
        String::new()
    };
    let result = sqlx::query(
        "UPDATE conversations SET assigned_agent_id = $1, assigned_at = $2 WHERE id = $3",
    )
    .bind(&agent_id)
    .bind(&assigned_at)
    .bind(&conversation_id)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            let Some(summary) = conversation_summary(&state, &conversation_id).await else {
                return (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "error": "failed to load conversation" })),
                )
                    .into_response();
            };
            (StatusCode::OK, Json(json!({ "conversation": summary }))).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

// Messages

async fn get_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT id, conversation_id, direction, content_type, body, media_url, file_name, status, is_note, external_id, created_at \
         FROM messages WHERE conversation_id = $1 ORDER BY created_at ASC",
    )
    .bind(&conversation_id)
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let messages = rows.into_iter().map(parse_message_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "messages": messages }))).into_response()
}

async fn post_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }

    let content_type = body
        .content_type
        .as_deref()
        .unwrap_or("text")
        .trim()
        .to_ascii_lowercase();
    if !matches!(content_type.as_str(), "text" | "image" | "document") {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unsupported content type" })),
        )
            .into_response();
    }
    let text = body.text.trim().to_string();
    let media_url = body.media_url.unwrap_or_default().trim().to_string();
    if text.is_empty() && media_url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "text is required" })),
        )
            .into_response();
    }
    if content_type != "text" && media_url.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "mediaUrl is required for media messages" })),
        )
            .into_response();
    }

    let Some(conversation) = find_conversation_by_id(&state, &conversation_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };

    let recipient = if body.internal_note {
        None
    } else {
        let Some(to) = contact_phone(&state, &conversation.contact_id).await else {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "conversation contact has no phone" })),
            )
                .into_response();
        };
        Some(to)
    };

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.clone(),
        direction: "outbound".to_string(),
        content_type,
        body: text,
        media_url,
        file_name: body.file_name.unwrap_or_default().trim().to_string(),
        // notes never leave the dashboard, so there is nothing to deliver
        status: if body.internal_note { "sent" } else { "sending" }.to_string(),
        is_note: body.internal_note,
        external_id: String::new(),
        created_at: now_iso(),
    };
    if let Err(err) = insert_message_row(&state.db, &message).await {
        error!(error = %err, conversation_id = %conversation_id, "failed to persist outbound message");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response();
    }

    if !message.is_note {
        // outbound traffic refreshes the preview but never the customer window
        let _ = sqlx::query(
            "UPDATE conversations SET last_message = $1, last_message_time = $2 WHERE id = $3",
        )
        .bind(message_preview(&message.body))
        .bind(&message.created_at)
        .bind(&conversation_id)
        .execute(&state.db)
        .await;
    }

    if let Some(to) = recipient {
        let payload = outbound_message_payload(&to, &conversation.business_number, &message);
        tokio::spawn(deliver_and_mark(
            state.clone(),
            message.id.clone(),
            payload,
        ));
    }

    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
}

async fn send_template_message(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<SendTemplateBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }

    let Some(conversation) = find_conversation_by_id(&state, &conversation_id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response();
    };

    let template_name = body.template_name.trim().to_string();
    let row = sqlx::query(
        "SELECT id, name, language, category, body, created_at FROM templates WHERE name = $1",
    )
    .bind(&template_name)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "template not found" })),
        )
            .into_response();
    };
    let template = parse_template_row(row);

    let Some(to) = contact_phone(&state, &conversation.contact_id).await else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "conversation contact has no phone" })),
        )
            .into_response();
    };

    let message = ChatMessage {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.clone(),
        direction: "outbound".to_string(),
        content_type: "template".to_string(),
        body: render_template_body(&template.body, &body.params),
        media_url: String::new(),
        file_name: String::new(),
        status: "sending".to_string(),
        is_note: false,
        external_id: String::new(),
        created_at: now_iso(),
    };
    if let Err(err) = insert_message_row(&state.db, &message).await {
        error!(error = %err, conversation_id = %conversation_id, "failed to persist template message");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response();
    }
    let _ = sqlx::query(
        "UPDATE conversations SET last_message = $1, last_message_time = $2 WHERE id = $3",
    )
    .bind(message_preview(&message.body))
    .bind(&message.created_at)
    .bind(&conversation_id)
    .execute(&state.db)
    .await;

    let payload =
        template_message_payload(&to, &conversation.business_number, &template, &body.params);
    tokio::spawn(deliver_and_mark(
        state.clone(),
        message.id.clone(),
        payload,
    ));

    (StatusCode::CREATED, Json(json!({ "message": message }))).into_response()
}

// Templates

async fn get_templates(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT id, name, language, category, body, created_at FROM templates ORDER BY name ASC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let templates = rows.into_iter().map(parse_template_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "templates": templates }))).into_response()
}

async fn create_template(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreateTemplateBody>,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let name = body.name.trim().to_string();
    let template_body = body.body.trim().to_string();
    if name.is_empty() || template_body.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "name and body are required" })),
        )
            .into_response();
    }

    let template = MessageTemplate {
        id: Uuid::new_v4().to_string(),
        name,
        language: {
            let lang = body.language.trim().to_string();
            if lang.is_empty() {
                "en".to_string()
            } else {
                lang
            }
        },
        category: {
            let category = body.category.trim().to_string();
            if category.is_empty() {
                "utility".to_string()
            } else {
                category
            }
        },
        body: template_body,
        created_at: now_iso(),
    };
    let result = sqlx::query(
        "INSERT INTO templates (id, name, language, category, body, created_at) VALUES ($1,$2,$3,$4,$5,$6) ON CONFLICT (name) DO NOTHING",
    )
    .bind(&template.id)
    .bind(&template.name)
    .bind(&template.language)
    .bind(&template.category)
    .bind(&template.body)
    .bind(&template.created_at)
    .execute(&state.db)
    .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            (StatusCode::CREATED, Json(json!({ "template": template }))).into_response()
        }
        Ok(_) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "template name already exists" })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

async fn delete_template(
    Path(template_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let result = sqlx::query("DELETE FROM templates WHERE id = $1")
        .bind(&template_id)
        .execute(&state.db)
        .await;
    match result {
        Ok(done) if done.rows_affected() > 0 => {
            (StatusCode::OK, Json(json!({ "ok": true }))).into_response()
        }
        Ok(_) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "template not found" })),
        )
            .into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
    }
}

// Payments

async fn get_payments(State(state): State<Arc<AppState>>, headers: HeaderMap) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let rows = sqlx::query(
        "SELECT id, contact_id, conversation_id, contact_name, contact_phone, amount, currency, description, razorpay_link_id, razorpay_payment_id, short_url, message_status, status, created_by, created_at, updated_at \
         FROM payments ORDER BY created_at DESC",
    )
    .fetch_all(&state.db)
    .await
    .unwrap_or_default();
    let payments = rows.into_iter().map(parse_payment_row).collect::<Vec<_>>();
    (StatusCode::OK, Json(json!({ "payments": payments }))).into_response()
}

async fn get_payment(
    Path(payment_id): Path<String>,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    if let Err(err) = auth_agent_from_headers(&state, &headers).await {
        return err.into_response();
    }
    let row = sqlx::query(
        "SELECT id, contact_id, conversation_id, contact_name, contact_phone, amount, currency, description, razorpay_link_id, razorpay_payment_id, short_url, message_status, status, created_by, created_at, updated_at \
         FROM payments WHERE id = $1",
    )
    .bind(&payment_id)
    .fetch_optional(&state.db)
    .await
    .ok()
    .flatten();
    let Some(row) = row else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "payment not found" })),
        )
            .into_response();
    };
    (
        StatusCode::OK,
        Json(json!({ "payment": parse_payment_row(row) })),
    )
        .into_response()
}

async fn create_payment(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CreatePaymentBody>,
) -> impl IntoResponse {
    let profile = match auth_agent_from_headers(&state, &headers).await {
        Ok(profile) => profile,
        Err(err) => return err.into_response(),
    };

    if body.amount <= 0 {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "amount must be positive" })),
        )
            .into_response();
    }
    let currency = {
        let currency = body.currency.trim().to_ascii_uppercase();
        if currency.is_empty() {
            "INR".to_string()
        } else {
            currency
        }
    };
    let description = body.description.trim().to_string();

    let conversation = match body.conversation_id.as_deref().map(str::trim) {
        Some(id) if !id.is_empty() => {
            let Some(conversation) = find_conversation_by_id(&state, id).await else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "conversation not found" })),
                )
                    .into_response();
            };
            Some(conversation)
        }
        _ => None,
    };

    let contact_id = body
        .contact_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .or_else(|| conversation.as_ref().map(|c| c.contact_id.clone()));

    // Snapshot the contact's name and phone now: later edits to the contact
    // must not retroactively alter payment history.
    let (contact_name, contact_phone_snapshot) = match contact_id.as_deref() {
        Some(id) => {
            let row = sqlx::query("SELECT name, phone FROM contacts WHERE id = $1")
                .bind(id)
                .fetch_optional(&state.db)
                .await
                .ok()
                .flatten();
            let Some(row) = row else {
                return (
                    StatusCode::NOT_FOUND,
                    Json(json!({ "error": "contact not found" })),
                )
                    .into_response();
            };
            (
                row.get::<String, _>("name"),
                row.get::<String, _>("phone"),
            )
        }
        None => (String::new(), String::new()),
    };

    let link = match create_razorpay_payment_link(
        &state,
        body.amount,
        &currency,
        &description,
        &contact_name,
        &contact_phone_snapshot,
    )
    .await
    {
        Ok(link) => link,
        Err(err) => {
            error!(error = %err, "payment link creation failed");
            return (StatusCode::BAD_GATEWAY, Json(json!({ "error": err }))).into_response();
        }
    };

    let now = now_iso();
    let send_link = body.send_link && conversation.is_some();
    let payment = Payment {
        id: Uuid::new_v4().to_string(),
        contact_id: contact_id.unwrap_or_default(),
        conversation_id: conversation
            .as_ref()
            .map(|c| c.id.clone())
            .unwrap_or_default(),
        contact_name,
        contact_phone: contact_phone_snapshot,
        amount: body.amount,
        currency,
        description,
        razorpay_link_id: link
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        razorpay_payment_id: String::new(),
        short_url: link
            .get("short_url")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string(),
        message_status: if send_link { "pending" } else { "" }.to_string(),
        status: "created".to_string(),
        created_by: profile.name.clone(),
        created_at: now.clone(),
        updated_at: now,
    };
    let inserted = sqlx::query(
        "INSERT INTO payments (id, contact_id, conversation_id, contact_name, contact_phone, amount, currency, description, razorpay_link_id, razorpay_payment_id, short_url, message_status, status, created_by, created_at, updated_at) \
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16)",
    )
    .bind(&payment.id)
    .bind(&payment.contact_id)
    .bind(&payment.conversation_id)
    .bind(&payment.contact_name)
    .bind(&payment.contact_phone)
    .bind(payment.amount)
    .bind(&payment.currency)
    .bind(&payment.description)
    .bind(&payment.razorpay_link_id)
    .bind(&payment.razorpay_payment_id)
    .bind(&payment.short_url)
    .bind(&payment.message_status)
    .bind(&payment.status)
    .bind(&payment.created_by)
    .bind(&payment.created_at)
    .bind(&payment.updated_at)
    .execute(&state.db)
    .await
    .is_ok();
    if !inserted {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "failed to persist payment" })),
        )
            .into_response();
    }

    if send_link && !payment.short_url.is_empty() {
        if let Some(conversation) = conversation {
            if let Some(to) = contact_phone(&state, &conversation.contact_id).await {
                let text = if payment.description.is_empty() {
                    payment.short_url.clone()
                } else {
                    format!("{}\n{}", payment.description, payment.short_url)
                };
                let message = ChatMessage {
                    id: Uuid::new_v4().to_string(),
                    conversation_id: conversation.id.clone(),
                    direction: "outbound".to_string(),
                    content_type: "text".to_string(),
                    body: text,
                    media_url: String::new(),
                    file_name: String::new(),
                    status: "sending".to_string(),
                    is_note: false,
                    external_id: String::new(),
                    created_at: now_iso(),
                };
                if insert_message_row(&state.db, &message).await.is_ok() {
                    let _ = sqlx::query(
                        "UPDATE conversations SET last_message = $1, last_message_time = $2 WHERE id = $3",
                    )
                    .bind(message_preview(&message.body))
                    .bind(&message.created_at)
                    .bind(&conversation.id)
                    .execute(&state.db)
                    .await;
                    let payload = outbound_message_payload(
                        &to,
                        &conversation.business_number,
                        &message,
                    );
                    tokio::spawn(deliver_payment_link(
                        state.clone(),
                        message.id.clone(),
                        payment.id.clone(),
                        payload,
                    ));
                }
            }
        }
    }

    (StatusCode::CREATED, Json(json!({ "payment": payment }))).into_response()
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": now_iso() }))
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let state = Arc::new(AppState {
        db,
        http_client: reqwest::Client::new(),
        whatsapp_api_url: env::var("WHATSAPP_API_URL")
            .unwrap_or_default()
            .trim_end_matches('/')
            .to_string(),
        whatsapp_api_token: env::var("WHATSAPP_API_TOKEN").unwrap_or_default(),
        razorpay_key_id: env::var("RAZORPAY_KEY_ID").unwrap_or_default(),
        razorpay_key_secret: env::var("RAZORPAY_KEY_SECRET").unwrap_or_default(),
        razorpay_webhook_secret: env::var("RAZORPAY_WEBHOOK_SECRET").unwrap_or_default(),
    });

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/auth/signup", post(signup_agent))
        .route("/api/auth/login", post(login_agent))
        .route("/api/auth/me", get(get_me))
        .route("/api/agents", get(get_agents))
        .route("/api/contacts", get(get_contacts).post(create_contact))
        .route(
            "/api/contacts/{contact_id}",
            get(get_contact).patch(patch_contact).delete(delete_contact),
        )
        .route(
            "/api/contacts/{contact_id}/conversations",
            get(get_contact_conversations),
        )
        .route(
            "/api/conversations",
            get(get_conversations).post(open_conversation),
        )
        .route("/api/conversations/{conversation_id}", get(get_conversation))
        .route(
            "/api/conversations/{conversation_id}/read",
            post(mark_conversation_read),
        )
        .route(
            "/api/conversations/{conversation_id}/status",
            patch(patch_conversation_status),
        )
        .route(
            "/api/conversations/{conversation_id}/assignee",
            patch(patch_conversation_assignee),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_messages).post(post_message),
        )
        .route(
            "/api/conversations/{conversation_id}/template",
            post(send_template_message),
        )
        .route("/api/templates", get(get_templates).post(create_template))
        .route(
            "/api/templates/{template_id}",
            axum::routing::delete(delete_template),
        )
        .route("/api/payments", get(get_payments).post(create_payment))
        .route("/api/payments/{payment_id}", get(get_payment))
        .route("/api/webhooks/whatsapp", post(whatsapp_webhook_event))
        .route("/api/webhooks/razorpay", post(razorpay_webhook_event))
        .layer(CorsLayer::permissive())
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!(addr = %addr, "wacrm server listening");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_rendering_fills_positional_slots() {
        let rendered = render_template_body(
            "Hi {{1}}, your order {{2}} is ready.",
            &["Asha".to_string(), "#42".to_string()],
        );
        assert_eq!(rendered, "Hi Asha, your order #42 is ready.");
    }

    #[test]
    fn template_rendering_keeps_unfilled_slots() {
        let rendered = render_template_body("Hi {{1}}, code {{2}}", &["Asha".to_string()]);
        assert_eq!(rendered, "Hi Asha, code {{2}}");
    }

    #[test]
    fn template_rendering_ignores_zero_slot() {
        let rendered = render_template_body("{{0}} stays", &["x".to_string()]);
        assert_eq!(rendered, "{{0}} stays");
    }

    #[test]
    fn email_normalization_trims_and_lowercases() {
        assert_eq!(normalize_email("  Agent@Example.COM "), "agent@example.com");
    }

    #[test]
    fn outbound_text_payload_shape() {
        let message = ChatMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            direction: "outbound".to_string(),
            content_type: "text".to_string(),
            body: "hello".to_string(),
            media_url: String::new(),
            file_name: String::new(),
            status: "sending".to_string(),
            is_note: false,
            external_id: String::new(),
            created_at: now_iso(),
        };
        let payload = outbound_message_payload("919876543210", "918888888888", &message);
        assert_eq!(payload["type"], "text");
        assert_eq!(payload["to"], "919876543210");
        assert_eq!(payload["from"], "918888888888");
        assert_eq!(payload["text"]["body"], "hello");
    }

    #[test]
    fn outbound_document_payload_defaults_filename() {
        let message = ChatMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            direction: "outbound".to_string(),
            content_type: "document".to_string(),
            body: "invoice attached".to_string(),
            media_url: "https://cdn.example/invoice.pdf".to_string(),
            file_name: String::new(),
            status: "sending".to_string(),
            is_note: false,
            external_id: String::new(),
            created_at: now_iso(),
        };
        let payload = outbound_message_payload("1", "default", &message);
        assert_eq!(payload["type"], "document");
        assert_eq!(payload["document"]["filename"], "attachment");
        assert_eq!(payload["document"]["link"], "https://cdn.example/invoice.pdf");
    }

    #[test]
    fn template_payload_carries_body_parameters() {
        let template = MessageTemplate {
            id: "t1".to_string(),
            name: "order_update".to_string(),
            language: "en".to_string(),
            category: "utility".to_string(),
            body: "Hi {{1}}".to_string(),
            created_at: now_iso(),
        };
        let payload =
            template_message_payload("1", "default", &template, &["Asha".to_string()]);
        assert_eq!(payload["type"], "template");
        assert_eq!(payload["template"]["name"], "order_update");
        assert_eq!(
            payload["template"]["components"][0]["parameters"][0]["text"],
            "Asha"
        );
    }

    #[test]
    fn template_payload_omits_components_without_params() {
        let template = MessageTemplate {
            id: "t1".to_string(),
            name: "greeting".to_string(),
            language: "en".to_string(),
            category: "utility".to_string(),
            body: "Hello there".to_string(),
            created_at: now_iso(),
        };
        let payload = template_message_payload("1", "default", &template, &[]);
        assert!(payload["template"].get("components").is_none());
    }
}
