use axum::{Router, body::Body, http::header, response::Response, routing::get};
use furnish_infernum::{ImageResolver, ImageSource, ValidationError, config::ImageSettings};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use std::{io::Cursor, net::SocketAddr, time::Duration};

fn png(width: u32, height: u32) -> Vec<u8> {
    let mut out = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, Rgb([30, 60, 90])))
        .write_to(&mut out, ImageFormat::Png)
        .unwrap();
    out.into_inner()
}

/// Serves `app` on a loopback port from its own runtime thread, so the
/// blocking fetch under test never runs inside an async context.
fn serve(app: Router) -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.set_nonblocking(true).unwrap();
    let addr = listener.local_addr().unwrap();

    std::thread::spawn(move || {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });
    });
    addr
}

fn image_server() -> SocketAddr {
    let room = png(800, 600);
    let tiny = png(120, 90);

    let app = Router::new()
        .route(
            "/room.png",
            get(move || {
                let body = room.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], body) }
            }),
        )
        .route(
            "/tiny.png",
            get(move || {
                let body = tiny.clone();
                async move { ([(header::CONTENT_TYPE, "image/png")], body) }
            }),
        )
        .route(
            "/listing.html",
            get(|| async { ([(header::CONTENT_TYPE, "text/html")], "<html></html>") }),
        )
        .route(
            "/untyped",
            get(|| async { Response::new(Body::from(png(800, 600))) }),
        )
        .route(
            "/garbage.png",
            get(|| async { ([(header::CONTENT_TYPE, "image/png")], vec![0u8, 1, 2, 3]) }),
        );
    serve(app)
}

fn resolve(addr: SocketAddr, path: &str) -> Result<(u32, u32), ValidationError> {
    ImageResolver::default()
        .resolve(&ImageSource::Url(format!("http://{addr}{path}")))
        .map(|image| (image.width(), image.height()))
}

#[test]
fn test_url_image_is_fetched_and_validated() {
    let addr = image_server();
    assert_eq!(resolve(addr, "/room.png").unwrap(), (800, 600));
}

#[test]
fn test_url_rejections() {
    let addr = image_server();

    assert!(matches!(
        resolve(addr, "/listing.html"),
        Err(ValidationError::NotAnImage { ref content_type }) if content_type == "text/html"
    ));
    assert!(matches!(
        resolve(addr, "/untyped"),
        Err(ValidationError::NotAnImage { .. })
    ));
    assert!(matches!(
        resolve(addr, "/missing.png"),
        Err(ValidationError::NetworkError(_))
    ));
    assert!(matches!(
        resolve(addr, "/garbage.png"),
        Err(ValidationError::Corrupt(_))
    ));
    assert!(matches!(
        resolve(addr, "/tiny.png"),
        Err(ValidationError::TooSmall {
            width: 120,
            height: 90,
            ..
        })
    ));
}

#[test]
fn test_slow_server_times_out() {
    let app = Router::new().route(
        "/slow.png",
        get(|| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            ([(header::CONTENT_TYPE, "image/png")], png(800, 600))
        }),
    );
    let addr = serve(app);

    let resolver = ImageResolver::new(ImageSettings {
        fetch_timeout_secs: 1,
        ..ImageSettings::default()
    });
    let err = resolver
        .resolve(&ImageSource::Url(format!("http://{addr}/slow.png")))
        .unwrap_err();
    assert_eq!(err.reason(), "network_error");
}

#[test]
fn test_oversized_body_is_rejected_before_decoding() {
    let addr = image_server();

    let resolver = ImageResolver::new(ImageSettings {
        max_alloc: 256,
        ..ImageSettings::default()
    });
    let err = resolver
        .resolve(&ImageSource::Url(format!("http://{addr}/room.png")))
        .unwrap_err();
    assert!(
        matches!(
            err,
            ValidationError::UnsafeImage(ref message) if message.contains("response body")
        ),
        "{err:?}"
    );
}
