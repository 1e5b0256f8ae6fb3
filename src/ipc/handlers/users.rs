use crate::ipc::error::{ok, HandlerErr};
use crate::ipc::helpers::{db_conn, optional_str, required_text};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use uuid::Uuid;

const ROLES: [&str; 3] = ["principal", "teacher", "student"];

fn create_user(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let name = required_text(params, "name")?;
    let role = required_text(params, "role")?;
    if !ROLES.contains(&role.as_str()) {
        return Err(
            HandlerErr::bad_params("role must be one of: principal, teacher, student")
                .with_details(json!({ "role": role })),
        );
    }

    let user_id = Uuid::new_v4().to_string();
    conn.execute(
        "INSERT INTO users(id, name, role) VALUES(?, ?, ?)",
        (&user_id, &name, &role),
    )
    .map_err(|e| {
        HandlerErr::new("db_insert_failed", e.to_string()).with_details(json!({ "table": "users" }))
    })?;

    Ok(json!({ "userId": user_id, "name": name, "role": role }))
}

fn map_user_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": r.get::<_, String>(0)?,
        "name": r.get::<_, String>(1)?,
        "role": r.get::<_, String>(2)?,
    }))
}

fn list_users(conn: &Connection, params: &serde_json::Value) -> Result<serde_json::Value, HandlerErr> {
    let role = optional_str(params, "role");

    // Role is an equality filter; no free-form queries.
    let mut stmt = match &role {
        Some(_) => conn.prepare("SELECT id, name, role FROM users WHERE role = ? ORDER BY name"),
        None => conn.prepare("SELECT id, name, role FROM users ORDER BY name"),
    }
    .map_err(HandlerErr::query_failed)?;

    let users: Vec<serde_json::Value> = match &role {
        Some(role) => stmt.query_map([role], map_user_row),
        None => stmt.query_map([], map_user_row),
    }
    .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    .map_err(HandlerErr::query_failed)?;

    Ok(json!({ "users": users }))
}

fn handle(
    state: &mut AppState,
    req: &Request,
    f: fn(&Connection, &serde_json::Value) -> Result<serde_json::Value, HandlerErr>,
) -> serde_json::Value {
    let conn = match db_conn(state) {
        Ok(c) => c,
        Err(e) => return e.response(&req.id),
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(e) => e.response(&req.id),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "users.create" => Some(handle(state, req, create_user)),
        "users.list" => Some(handle(state, req, list_users)),
        _ => None,
    }
}
