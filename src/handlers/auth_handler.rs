//! `/api/login` and `/api/register`, the two form-POST endpoints spec §9
//! scenario S3 names against the fixture DB (`pools::db::FixtureDbHandle`).
//! Both are registered into a `routing::Router` at startup and run through
//! the same `(request, context)` dispatch as any other dynamic route.

pub use crate::prelude::*;
use crate::websocket::json::escape;

pub fn handle_login(request: &HttpRequest, ctx: &Context) -> HttpResponse {
    let username = request.form_fields.get("username").map(String::as_str).unwrap_or("");
    let password = request.form_fields.get("password").map(String::as_str).unwrap_or("");

    let Some(handle) = ctx.db_pool.acquire() else {
        return json_response(503, "error", "数据库繁忙，请稍后再试");
    };

    if handle.check_login(username, password) {
        if let Some(session_id) = &request.session_id {
            ctx.session_store.lock().unwrap().set_username(session_id, username);
        }
        json_response(200, "ok", "登录成功")
    } else {
        json_response(401, "error", "用户名或密码错误")
    }
}

pub fn handle_register(request: &HttpRequest, ctx: &Context) -> HttpResponse {
    let username = request.form_fields.get("username").map(String::as_str).unwrap_or("");
    let password = request.form_fields.get("password").map(String::as_str).unwrap_or("");

    if username.is_empty() || password.is_empty() {
        return json_response(400, "error", "用户名和密码不能为空");
    }

    let Some(mut handle) = ctx.db_pool.acquire() else {
        return json_response(503, "error", "数据库繁忙，请稍后再试");
    };

    if handle.register(username, password) {
        json_response(201, "ok", "注册成功")
    } else {
        json_response(409, "error", "用户名已存在")
    }
}

fn json_response(status: u16, kind: &str, msg: &str) -> HttpResponse {
    let mut res = HttpResponse::new(status, &HttpResponse::status_text(status));
    let body = format!(r#"{{"status":"{}","msg":"{}"}}"#, escape(kind), escape(msg));
    res.set_body(body.into_bytes(), "application/json");
    res
}

#[cfg(test)]
mod tests {
    use super::*;

    fn login_request(username: &str, password: &str) -> HttpRequest {
        let mut req = HttpRequest::new();
        req.method = crate::http::Method::POST;
        req.url = "/api/login".to_string();
        req.form_fields.insert("username".to_string(), username.to_string());
        req.form_fields.insert("password".to_string(), password.to_string());
        req
    }

    #[test]
    fn correct_credentials_return_ok() {
        let ctx = Context::new(60, 1).unwrap();
        let req = login_request("alice", "xyz");
        let resp = handle_login(&req, &ctx);
        assert_eq!(resp.status_code, 200);
        assert!(String::from_utf8_lossy(&resp.body).contains("登录成功"));
    }

    #[test]
    fn wrong_password_returns_401() {
        let ctx = Context::new(60, 1).unwrap();
        let req = login_request("alice", "wrong");
        let resp = handle_login(&req, &ctx);
        assert_eq!(resp.status_code, 401);
    }

    #[test]
    fn register_then_login_round_trip() {
        let ctx = Context::new(60, 1).unwrap();
        let reg = login_request("carol", "pw");
        let resp = handle_register(&reg, &ctx);
        assert_eq!(resp.status_code, 201);

        let login = login_request("carol", "pw");
        let resp = handle_login(&login, &ctx);
        assert_eq!(resp.status_code, 200);
    }

    #[test]
    fn duplicate_registration_conflicts() {
        let ctx = Context::new(60, 1).unwrap();
        let reg = login_request("dave", "pw");
        assert_eq!(handle_register(&reg, &ctx).status_code, 201);
        assert_eq!(handle_register(&reg, &ctx).status_code, 409);
    }
}
