pub use crate::prelude::*;

pub fn handle_delete(
    request: &HttpRequest,
    r_cfg: &RouteConfig,
    s_cfg: &Arc<ServerConfig>,
) -> HttpResponse {
    let upload_base = PathBuf::from(&r_cfg.root).join(&r_cfg.upload_dir);

    // e.g., /upload/test.txt -> test.txt
    let relative_path = request.url.strip_prefix(&r_cfg.path).unwrap_or("");
    let target_path = upload_base.join(relative_path.trim_start_matches('/'));

    let mut res = HttpResponse::new(HTTP_OK, "OK");

    // Security: Canonicalize and Path Traversal Check.
    // Prevents DELETE /upload/../../etc/passwd
    let absolute_upload_base = match upload_base.canonicalize() {
        Ok(path) => path,
        Err(_) => {
            handle_error(&mut res, HTTP_NOT_FOUND, Some(s_cfg));
            return res;
        }
    };

    let absolute_target = match target_path.canonicalize() {
        Ok(path) => path,
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::NotFound => HTTP_NOT_FOUND,
                _ => HTTP_FORBIDDEN,
            };
            handle_error(&mut res, code, Some(s_cfg));
            return res;
        }
    };

    if !absolute_target.starts_with(&absolute_upload_base) {
        handle_error(&mut res, HTTP_FORBIDDEN, Some(s_cfg));
        return res;
    }

    if absolute_target.is_dir() {
        handle_error(&mut res, HTTP_FORBIDDEN, Some(s_cfg));
        return res;
    }

    match fs::remove_file(&absolute_target) {
        Ok(_) => HttpResponse::new(204, "No Content"),
        Err(e) => {
            let code = match e.kind() {
                ErrorKind::PermissionDenied => HTTP_FORBIDDEN,
                _ => HTTP_INTERNAL_SERVER_ERROR,
            };
            handle_error(&mut res, code, Some(s_cfg));
            res
        }
    }
}
