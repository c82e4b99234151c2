#[cfg(test)]
mod integration_tests {
    use mio::Poll;
    use server_proxy::config::{AppConfig, RouteConfig, ServerConfig};
    use server_proxy::http::Method;
    use server_proxy::server::{Server, ServerOptions};
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;
    use std::fs;

    #[test]
    fn test_pipelined_requests() {
        let test_root = "./tmp_pipeline_test";
        let _ = fs::remove_dir_all(test_root); // Clean start
        fs::create_dir_all(test_root).unwrap();
        fs::write(format!("{}/index.html", test_root), "Hello").unwrap();

        let mut config = AppConfig::default();
        let mut router1 = RouteConfig::default();

        router1.path = "/".to_string();
        router1.root = test_root.to_string();
        router1.methods = vec![Method::GET.to_string()];

        let server_cfg = ServerConfig {
            server_name: "localhost".to_string(),
            ports: vec![8081],
            root: test_root.to_string(),
            routes: vec![router1],
            default_server: true,
            ..Default::default()
        };
        config.servers.push(server_cfg);

        thread::spawn(move || {
            let poll = Poll::new().unwrap();
            let server = Server::new(config, &poll, ServerOptions::default()).unwrap();
            server.run(poll).unwrap();
        });

        thread::sleep(Duration::from_millis(300));

        let mut stream = TcpStream::connect("127.0.0.1:8081").unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let pipeline_data = "GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n\
                             GET /index.html HTTP/1.1\r\nHost: localhost\r\n\r\n";

        stream.write_all(pipeline_data.as_bytes()).unwrap();

        let mut buffer = [0u8; 4096];
        let n1 = stream.read(&mut buffer).unwrap();
        let res1 = String::from_utf8_lossy(&buffer[..n1]);

        assert!(
            res1.contains("200 OK"),
            "First response was not 200 OK. Check server logs."
        );

        if res1.matches("HTTP/1.1").count() < 2 {
            let n2 = stream.read(&mut buffer).unwrap();
            let res2 = String::from_utf8_lossy(&buffer[..n2]);
            assert!(res2.contains("200 OK"), "Second response was not 200 OK");
        }

        let _ = fs::remove_dir_all(test_root);
    }

    #[test]
    fn test_request_side_chunked_is_rejected() {
        let test_root = "./tmp_chunked_reject_test";
        let _ = fs::remove_dir_all(test_root);
        fs::create_dir_all(test_root).unwrap();

        let mut config = AppConfig::default();
        let mut router1 = RouteConfig::default();
        router1.path = "/".to_string();
        router1.root = test_root.to_string();
        router1.methods = vec![Method::GET.to_string(), Method::POST.to_string()];

        let server_cfg = ServerConfig {
            server_name: "127.0.0.1".to_string(),
            ports: vec![8082],
            root: test_root.to_string(),
            routes: vec![router1],
            default_server: true,
            ..Default::default()
        };
        config.servers.push(server_cfg);

        thread::spawn(move || {
            let poll = Poll::new().unwrap();
            let server = Server::new(config, &poll, ServerOptions::default()).unwrap();
            server.run(poll).unwrap();
        });

        thread::sleep(Duration::from_millis(300));

        let mut stream = TcpStream::connect("127.0.0.1:8082").unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        let headers = "POST / HTTP/1.1\r\n\
                       Host: 127.0.0.1:8082\r\n\
                       Transfer-Encoding: chunked\r\n\
                       Content-Type: text/plain\r\n\r\n";
        stream.write_all(headers.as_bytes()).unwrap();
        stream.write_all(b"5\r\nHello\r\n0\r\n\r\n").unwrap();

        let mut buffer = [0u8; 4096];
        let n = stream.read(&mut buffer).unwrap();
        let response = String::from_utf8_lossy(&buffer[..n]);
        assert!(
            response.contains("501"),
            "request-side chunked bodies must be rejected, got: {response}"
        );

        let _ = fs::remove_dir_all(test_root);
    }
}
