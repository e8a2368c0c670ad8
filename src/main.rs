use edge_http_server::{
    AuthMethod, DiskFileSystem, Frame, Method, Server, ServerConfig, ServerError, ServerResult, Status, TcpTransport,
};
use std::env;
use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn main() -> ServerResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = env::args().collect();
    if args.len() > 2 && args[1] == "--save-config" {
        return save_default_config(&args[2]);
    }

    let config = if args.len() > 1 && Path::new(&args[1]).exists() {
        ServerConfig::from_json_file(&args[1])?
    } else {
        ServerConfig::new().with_address("0.0.0.0", 8080)
    };

    let server = build_server(config).start()?;
    let transport = TcpTransport::bind(server)?;

    let running = transport.running();
    ctrlc::set_handler(move || {
        log::info!("Received shutdown signal");
        running.store(false, Ordering::Release);
    })
    .map_err(|e| ServerError::Config(format!("Cannot install signal handler: {}", e)))?;

    transport.run()
}

fn build_server(config: ServerConfig) -> Server {
    let mut server = Server::new(config);

    server.on("/", Method::Get).on_request(|_, res| {
        res.reply(Status::Ok, "text/html", "<h1>It works</h1>")
    });

    server.on("/visits", Method::Get).on_request(|req, res| {
        let visits = req
            .get_session_key("visits")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        req.set_session_key("visits", &visits.to_string());
        res.reply(Status::Ok, "text/plain", &format!("Visit {} on this connection", visits))
    });

    server.on("/private", Method::Get).on_request(|req, res| {
        if !req.authenticate("admin", "admin") {
            return req.request_authentication(res, AuthMethod::Digest, "", "");
        }
        res.reply(Status::Ok, "text/plain", "Welcome")
    });

    server
        .on("/upload", Method::Post)
        .on_upload(|_, chunk| {
            log::info!(
                "Upload {}: {} bytes at {}{}",
                chunk.filename,
                chunk.data.len(),
                chunk.index,
                if chunk.is_final { " (done)" } else { "" }
            );
            Ok(())
        });

    server
        .on("/form", Method::Post)
        .on_multipart(|_, chunk| {
            log::info!(
                "Field {} ({}): {} bytes",
                chunk.field.unwrap_or_default(),
                chunk.filename,
                chunk.data.len()
            );
            Ok(())
        })
        .on_request(|_, res| res.reply(Status::Ok, "text/plain", "Form received"));

    server
        .websocket("/ws")
        .on_connect(|_, conn| conn.queue_text("Hello"))
        .on_frame(|conn, frame| match frame.as_text() {
            Some(text) => conn.reply(Frame::text(text)),
            None => Ok(()),
        });

    server
        .serve_static("/static", Arc::new(DiskFileSystem), "./www")
        .set_cache_control("max-age=3600");

    server.on_open(|_, id| {
        log::debug!("Client {} connected", id);
        Ok(())
    });
    server.on_close(|server, id| {
        if server.registry().get(id).is_some() {
            server.send_all(&Frame::text(&format!("Client {} left", id)));
        }
        Ok(())
    });

    server
}

fn save_default_config(path: &str) -> ServerResult<()> {
    let config = ServerConfig::new();
    config.save_to_json_file(path)?;
    log::info!("Default configuration saved to: {}", path);
    Ok(())
}
