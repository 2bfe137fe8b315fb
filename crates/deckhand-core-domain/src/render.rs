use crate::settings::DeploySettings;
use serde_json::{json, Map, Value};

const ACME_LOCATION: &str = "/.well-known/acme-challenge/";

fn push_proxy_location(output: &mut String, settings: &DeploySettings) {
    output.push_str("    location / {\n");
    output.push_str(&format!(
        "        proxy_pass http://127.0.0.1:{};\n",
        settings.port
    ));
    output.push_str("        proxy_http_version 1.1;\n");
    output.push_str("        proxy_set_header Upgrade $http_upgrade;\n");
    output.push_str("        proxy_set_header Connection 'upgrade';\n");
    output.push_str("        proxy_set_header Host $host;\n");
    output.push_str("        proxy_set_header X-Real-IP $remote_addr;\n");
    output.push_str("        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n");
    output.push_str("        proxy_set_header X-Forwarded-Proto $scheme;\n");
    output.push_str("        proxy_cache_bypass $http_upgrade;\n");
    output.push_str(&format!(
        "        proxy_read_timeout {}s;\n",
        settings.proxy.read_timeout_secs
    ));
    output.push_str("    }\n");
}

const SECURITY_HEADERS: [(&str, &str); 4] = [
    ("X-Frame-Options", "SAMEORIGIN"),
    ("X-Content-Type-Options", "nosniff"),
    ("X-XSS-Protection", "1; mode=block"),
    ("Referrer-Policy", "strict-origin-when-cross-origin"),
];

fn push_header(output: &mut String, name: &str, value: &str) {
    output.push_str(&format!("    add_header {name} \"{value}\" always;\n"));
}

fn push_security_headers(output: &mut String) {
    for (name, value) in SECURITY_HEADERS {
        push_header(output, name, value);
    }
}

fn push_http_listen(output: &mut String, settings: &DeploySettings) {
    let proxy = &settings.proxy;
    let suffix = if proxy.default_server { " default_server" } else { "" };
    output.push_str(&format!("    listen {}{suffix};\n", proxy.listen));
    output.push_str(&format!("    listen [::]:{}{suffix};\n", proxy.listen));
}

fn push_acme_location(output: &mut String, settings: &DeploySettings) {
    if let Some(cert) = &settings.certificate {
        output.push_str(&format!("    location {ACME_LOCATION} {{\n"));
        output.push_str(&format!("        root {};\n", cert.webroot));
        output.push_str("    }\n");
    }
}

/// Plain HTTP site forwarding to the application port. When a certificate
/// is configured the ACME challenge directory is served from the webroot.
pub fn render_nginx_site(settings: &DeploySettings) -> String {
    let proxy = &settings.proxy;
    let mut output = String::new();
    output.push_str("server {\n");
    push_http_listen(&mut output, settings);
    output.push_str(&format!(
        "    server_name {};\n",
        proxy.server_names.join(" ")
    ));
    output.push_str(&format!(
        "    client_max_body_size {};\n",
        proxy.client_max_body_size
    ));
    push_security_headers(&mut output);
    push_acme_location(&mut output, settings);
    push_proxy_location(&mut output, settings);
    output.push_str("}\n");
    output
}

/// HTTP site used once the TLS site is live: ACME challenges are still
/// answered on plain HTTP, everything else is sent to HTTPS.
pub fn render_nginx_redirect_site(settings: &DeploySettings) -> Option<String> {
    settings.certificate.as_ref()?;
    let mut output = String::new();
    output.push_str("server {\n");
    push_http_listen(&mut output, settings);
    output.push_str(&format!(
        "    server_name {};\n",
        settings.proxy.server_names.join(" ")
    ));
    push_acme_location(&mut output, settings);
    output.push_str("    location / {\n");
    output.push_str("        return 301 https://$host$request_uri;\n");
    output.push_str("    }\n");
    output.push_str("}\n");
    Some(output)
}

/// TLS site for the certificate's domains. Returns `None` without a
/// certificate block.
pub fn render_nginx_tls_site(settings: &DeploySettings) -> Option<String> {
    let cert = settings.certificate.as_ref()?;
    let mut output = String::new();
    output.push_str("server {\n");
    output.push_str("    listen 443 ssl http2;\n");
    output.push_str("    listen [::]:443 ssl http2;\n");
    output.push_str(&format!("    server_name {};\n", cert.domains.join(" ")));
    output.push_str(&format!("    ssl_certificate {};\n", cert.fullchain_path()));
    output.push_str(&format!("    ssl_certificate_key {};\n", cert.privkey_path()));
    output.push_str("    ssl_protocols TLSv1.2 TLSv1.3;\n");
    output.push_str("    ssl_ciphers HIGH:!aNULL:!MD5;\n");
    output.push_str("    ssl_prefer_server_ciphers on;\n");
    output.push_str("    ssl_session_cache shared:SSL:10m;\n");
    output.push_str("    ssl_session_timeout 10m;\n");
    output.push_str(&format!(
        "    client_max_body_size {};\n",
        settings.proxy.client_max_body_size
    ));
    push_header(
        &mut output,
        "Strict-Transport-Security",
        "max-age=31536000; includeSubDomains",
    );
    push_security_headers(&mut output);
    push_proxy_location(&mut output, settings);
    output.push_str("}\n");
    Some(output)
}

/// pm2 ecosystem descriptor. Only non-secret environment is rendered.
pub fn render_pm2_ecosystem(settings: &DeploySettings) -> String {
    let process = &settings.process;
    let log_dir = settings.log_dir();

    let mut env = Map::new();
    env.insert("NODE_ENV".to_string(), Value::from(process.node_env.clone()));
    env.insert("PORT".to_string(), Value::from(settings.port.to_string()));
    for (key, value) in &process.env {
        env.insert(key.clone(), Value::from(value.clone()));
    }

    let exec_mode = if process.instances > 1 { "cluster" } else { "fork" };
    let app = json!({
        "name": settings.process_name(),
        "cwd": settings.app_dir,
        "script": process.script,
        "args": process.args,
        "instances": process.instances,
        "exec_mode": exec_mode,
        "autorestart": true,
        "max_restarts": process.max_restarts,
        "min_uptime": process.min_uptime,
        "out_file": format!("{log_dir}/out.log"),
        "error_file": format!("{log_dir}/error.log"),
        "merge_logs": true,
        "env": Value::Object(env),
    });
    let apps = serde_json::to_string_pretty(&json!([app])).unwrap_or_else(|_| "[]".to_string());
    format!("module.exports = {{\n  apps: {apps}\n}};\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::CertificateSettings;

    fn settings() -> DeploySettings {
        DeploySettings::from_json(
            r#"{
                "app_name": "shop",
                "app_dir": "/var/www/shop",
                "repo_url": "https://git.example.com/acme/shop.git",
                "proxy": { "server_names": ["shop.example.com"] }
            }"#,
        )
        .expect("settings")
    }

    #[test]
    fn renders_http_site_deterministically() {
        let rendered = render_nginx_site(&settings());
        let expected = concat!(
            "server {\n",
            "    listen 80;\n",
            "    listen [::]:80;\n",
            "    server_name shop.example.com;\n",
            "    client_max_body_size 10m;\n",
            "    add_header X-Frame-Options \"SAMEORIGIN\" always;\n",
            "    add_header X-Content-Type-Options \"nosniff\" always;\n",
            "    add_header X-XSS-Protection \"1; mode=block\" always;\n",
            "    add_header Referrer-Policy \"strict-origin-when-cross-origin\" always;\n",
            "    location / {\n",
            "        proxy_pass http://127.0.0.1:3000;\n",
            "        proxy_http_version 1.1;\n",
            "        proxy_set_header Upgrade $http_upgrade;\n",
            "        proxy_set_header Connection 'upgrade';\n",
            "        proxy_set_header Host $host;\n",
            "        proxy_set_header X-Real-IP $remote_addr;\n",
            "        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;\n",
            "        proxy_set_header X-Forwarded-Proto $scheme;\n",
            "        proxy_cache_bypass $http_upgrade;\n",
            "        proxy_read_timeout 90s;\n",
            "    }\n",
            "}\n",
        );
        assert_eq!(rendered, expected);
        assert_eq!(rendered, render_nginx_site(&settings()));
    }

    #[test]
    fn serves_acme_challenge_when_certificate_configured() {
        let mut settings = settings();
        assert!(render_nginx_tls_site(&settings).is_none());
        assert!(render_nginx_redirect_site(&settings).is_none());
        settings.certificate = Some(CertificateSettings {
            domains: vec!["shop.example.com".to_string()],
            email: "ops@example.com".to_string(),
            webroot: "/var/www/letsencrypt".to_string(),
            renew_before_days: 30,
            enable_renewal_timer: true,
        });

        let http = render_nginx_site(&settings);
        assert!(http.contains("    location /.well-known/acme-challenge/ {\n        root /var/www/letsencrypt;\n"));

        let tls = render_nginx_tls_site(&settings).expect("tls site");
        assert!(tls.contains("    listen 443 ssl http2;\n    listen [::]:443 ssl http2;\n"));
        assert!(tls.contains("ssl_ciphers HIGH:!aNULL:!MD5;"));
        assert!(tls.contains(
            "add_header Strict-Transport-Security \"max-age=31536000; includeSubDomains\" always;"
        ));
        assert!(tls.contains("add_header X-Content-Type-Options \"nosniff\" always;"));
        assert!(tls.contains("ssl_certificate /etc/letsencrypt/live/shop.example.com/fullchain.pem;"));
        assert!(tls.contains("ssl_certificate_key /etc/letsencrypt/live/shop.example.com/privkey.pem;"));
        assert!(tls.contains("proxy_pass http://127.0.0.1:3000;"));

        let redirect = render_nginx_redirect_site(&settings).expect("redirect site");
        assert!(redirect.contains("    listen 80;\n    listen [::]:80;\n"));
        assert!(redirect.contains("location /.well-known/acme-challenge/ {"));
        assert!(redirect.contains("return 301 https://$host$request_uri;"));
        assert!(!redirect.contains("proxy_pass"));
        let acme = redirect.find(ACME_LOCATION).expect("acme");
        let catch_all = redirect.find("location / {").expect("catch-all");
        assert!(acme < catch_all);
    }

    #[test]
    fn renders_pm2_descriptor_without_secrets() {
        let mut settings = settings();
        settings
            .process
            .env
            .insert("FEATURE_FLAGS".to_string(), "beta".to_string());
        let rendered = render_pm2_ecosystem(&settings);
        assert!(rendered.starts_with("module.exports = {\n  apps: ["));
        assert!(rendered.ends_with("\n};\n"));
        assert!(rendered.contains("\"name\": \"shop\""));
        assert!(rendered.contains("\"cwd\": \"/var/www/shop\""));
        assert!(rendered.contains("\"PORT\": \"3000\""));
        assert!(rendered.contains("\"FEATURE_FLAGS\": \"beta\""));
        assert!(rendered.contains("\"out_file\": \"/var/log/shop/out.log\""));
        assert_eq!(rendered, render_pm2_ecosystem(&settings));
    }
}
