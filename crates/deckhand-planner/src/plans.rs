use crate::commands::{
    as_user, check_script, content_matches, digest_matches, dir_owned_by, http_health,
    http_health_budget_secs, privileged, record_digest, shell_quote, unit_active,
    write_file_atomically,
};
use deckhand_core_domain::{
    render_nginx_redirect_site, render_nginx_site, render_nginx_tls_site, render_pm2_ecosystem,
    CertificateSettings, Check, DeploySettings, FailurePolicy, Plan, Step,
};

fn step(
    settings: &DeploySettings,
    id: &str,
    description: &str,
    precondition: Check,
    action: Vec<String>,
    postcondition: Check,
) -> Step {
    Step {
        id: id.to_string(),
        description: description.to_string(),
        precondition,
        action,
        postcondition,
        on_failure: FailurePolicy::Abort,
        timeout_secs: settings.timeouts.default_secs,
        check_timeout_secs: settings.timeouts.check_secs,
    }
}

/// Same check before and after: a satisfied precondition is the postcondition.
fn converged(description: &str, command: String) -> (Check, Check) {
    let check = Check::new(description, command);
    (check.clone(), check)
}

fn user_check(settings: &DeploySettings, conditions: &[String]) -> String {
    as_user(&settings.service_user, &check_script(conditions))
}

fn root_check(settings: &DeploySettings, conditions: &[String]) -> String {
    privileged(settings.use_sudo, &check_script(conditions))
}

fn in_app_dir(settings: &DeploySettings) -> String {
    format!("cd {}", shell_quote(&settings.app_dir))
}

pub fn sync_and_install(settings: &DeploySettings) -> Plan {
    let user = &settings.service_user;
    let app_dir = &settings.app_dir;
    let cd = in_app_dir(settings);

    let (pre, post) = converged(
        "application directory exists and belongs to the service account",
        root_check(settings, &[dir_owned_by(app_dir, user)]),
    );
    let ensure_app_dir = step(
        settings,
        "ensure-app-dir",
        "Create the application directory",
        pre,
        vec![privileged(
            settings.use_sudo,
            &format!(
                "mkdir -p {dir} && chown {user} {dir}",
                dir = shell_quote(app_dir),
                user = shell_quote(user)
            ),
        )],
        post,
    );

    let revision = shell_quote(&settings.revision);
    let remote_refs = [
        format!("refs/heads/{}", settings.revision),
        format!("refs/tags/{}", settings.revision),
        format!("refs/tags/{}^{{}}", settings.revision),
    ]
    .iter()
    .map(|reference| shell_quote(reference))
    .collect::<Vec<_>>()
    .join(" ");
    let (pre, post) = converged(
        "checkout is at the requested revision",
        user_check(
            settings,
            &[
                cd.clone(),
                format!("test -f {}", shell_quote(&settings.install.manifest_file)),
                format!(
                    "head=$(git rev-parse HEAD 2>/dev/null) && \
                     want=$(git ls-remote origin {remote_refs} 2>/dev/null | awk 'END {{ print $1 }}') && \
                     if [ -z \"$want\" ]; then want=$(git rev-parse --verify -q {revision}^{{commit}} 2>/dev/null); fi && \
                     [ -n \"$want\" ] && [ \"$head\" = \"$want\" ]"
                ),
            ],
        ),
    );
    let sync_source = step(
        settings,
        "sync-source",
        "Fetch the repository and check out the requested revision",
        pre,
        vec![as_user(
            user,
            &format!(
                "set -e\n{cd}\n\
                 if [ ! -d .git ]; then git init -q; fi\n\
                 if git remote get-url origin >/dev/null 2>&1; then git remote set-url origin {repo}; \
                 else git remote add origin {repo}; fi\n\
                 git fetch -q --tags --force origin {revision}\n\
                 git checkout -q -f --detach FETCH_HEAD\n\
                 git rev-parse HEAD",
                repo = shell_quote(&settings.repo_url),
            ),
        )],
        post,
    );

    let state_dir = shell_quote(".deckhand");
    let stamp = ".deckhand/install.sha256";
    let (pre, post) = converged(
        "dependencies are installed for the current lock file",
        user_check(
            settings,
            &[
                cd.clone(),
                format!("test -f {}", shell_quote(&settings.install.lock_file)),
                format!("test -d {}", shell_quote(&settings.install.dependency_dir)),
                digest_matches(&settings.install.lock_file, stamp),
            ],
        ),
    );
    let install_dependencies = Step {
        on_failure: FailurePolicy::retry_then_abort(2),
        timeout_secs: settings.timeouts.install_secs,
        ..step(
            settings,
            "install-dependencies",
            "Install dependencies from the lock file",
            pre,
            vec![as_user(
                user,
                &format!(
                    "set -e\n{cd}\n{install}\nmkdir -p {state_dir}\n{record}",
                    install = settings.install.command,
                    record = record_digest(&settings.install.lock_file, stamp),
                ),
            )],
            post,
        )
    };

    Plan::new(
        "sync-and-install",
        vec![ensure_app_dir, sync_source, install_dependencies],
    )
}

pub fn build(settings: &DeploySettings) -> Plan {
    let cd = in_app_dir(settings);
    let (pre, post) = converged(
        "build output exists for the checked-out revision",
        user_check(
            settings,
            &[
                cd.clone(),
                format!("test -f {}", shell_quote(&settings.build.marker)),
                "test -f .deckhand/build.rev".to_string(),
                "[ \"$(cat .deckhand/build.rev)\" = \"$(git rev-parse HEAD)\" ]".to_string(),
            ],
        ),
    );

    let mut action = Vec::new();
    if settings.build.clean {
        action.push(as_user(
            &settings.service_user,
            &format!(
                "{cd} && rm -rf {}",
                shell_quote(&settings.build.output_dir)
            ),
        ));
    }
    action.push(as_user(
        &settings.service_user,
        &format!("{cd} && {}", settings.build.command),
    ));
    action.push(as_user(
        &settings.service_user,
        &format!("{cd} && mkdir -p .deckhand && git rev-parse HEAD > .deckhand/build.rev"),
    ));

    let build_app = Step {
        timeout_secs: settings.timeouts.build_secs,
        ..step(
            settings,
            "build-app",
            "Build the application",
            pre,
            action,
            post,
        )
    };
    Plan::new("build", vec![build_app])
}

pub fn configure_process_manager(settings: &DeploySettings) -> Plan {
    let user = &settings.service_user;
    let log_dir = settings.log_dir();
    let descriptor = settings.descriptor_path();
    let applied = format!("{}/descriptor.applied", settings.state_dir());
    let rendered = render_pm2_ecosystem(settings);
    let process = &settings.process;

    let (pre, post) = converged(
        "log directory exists and belongs to the service account",
        root_check(settings, &[dir_owned_by(&log_dir, user)]),
    );
    let ensure_log_dir = step(
        settings,
        "ensure-log-dir",
        "Create the process log directory",
        pre,
        vec![privileged(
            settings.use_sudo,
            &format!(
                "mkdir -p {dir} && chown {user} {dir}",
                dir = shell_quote(&log_dir),
                user = shell_quote(user)
            ),
        )],
        post,
    );

    let (pre, post) = converged(
        "process descriptor matches the rendered descriptor",
        user_check(settings, &[content_matches(&descriptor, &rendered)]),
    );
    let write_descriptor = step(
        settings,
        "write-process-descriptor",
        "Write the pm2 ecosystem file",
        pre,
        vec![as_user(
            user,
            &write_file_atomically(&descriptor, &rendered, "0644"),
        )],
        post,
    );

    let health_url = settings.health_url();
    let health_window = http_health_budget_secs(process.health_attempts, process.health_interval_secs);
    let health_check_timeout = settings.timeouts.check_secs.max(health_window.saturating_add(5));
    let cd = in_app_dir(settings);

    let start_process = Step {
        on_failure: if process.dev_fallback {
            FailurePolicy::Continue
        } else {
            FailurePolicy::Abort
        },
        timeout_secs: settings.timeouts.default_secs,
        check_timeout_secs: health_check_timeout,
        ..step(
            settings,
            "start-process",
            "Start or reload the application under pm2",
            Check::new(
                "applied descriptor is current and the service answers",
                user_check(
                    settings,
                    &[
                        format!("cmp -s {} {}", shell_quote(&descriptor), shell_quote(&applied)),
                        http_health(&health_url, 1, 0),
                    ],
                ),
            ),
            vec![as_user(
                user,
                &format!(
                    "set -e\n{cd}\n\
                     pm2 startOrReload {descriptor} --update-env\n\
                     pm2 save\n\
                     mkdir -p {state}\n\
                     cp {descriptor} {applied}",
                    descriptor = shell_quote(&descriptor),
                    state = shell_quote(&settings.state_dir()),
                    applied = shell_quote(&applied),
                ),
            )],
            Check::new(
                "service answers on its health endpoint",
                user_check(
                    settings,
                    &[http_health(
                        &health_url,
                        process.health_attempts,
                        process.health_interval_secs,
                    )],
                ),
            ),
        )
    };

    let mut steps = vec![ensure_log_dir, write_descriptor, start_process];

    if process.dev_fallback {
        let name = shell_quote(&settings.process_name());
        steps.push(Step {
            check_timeout_secs: health_check_timeout,
            ..step(
                settings,
                "dev-mode-fallback",
                "Start the development server when the production start is unhealthy",
                Check::new(
                    "service answers on its health endpoint",
                    user_check(settings, &[http_health(&health_url, 1, 0)]),
                ),
                vec![as_user(
                    user,
                    &format!(
                        "{cd}\n\
                         pm2 delete {name} >/dev/null 2>&1 || true\n\
                         pm2 start {script} --name {name} -- {dev_args} && pm2 save",
                        script = shell_quote(&process.script),
                        dev_args = process.dev_args,
                    ),
                )],
                Check::new(
                    "service answers on its health endpoint",
                    user_check(
                        settings,
                        &[http_health(
                            &health_url,
                            process.health_attempts,
                            process.health_interval_secs,
                        )],
                    ),
                ),
            )
        });
    }

    Plan::new("configure-process-manager", steps)
}

/// Writes a candidate, stashes every path the swap touches in a backup
/// directory, then swaps and runs `nginx -t`. On rejection the stashed
/// entries are moved back as they were, symlinks included.
fn apply_site_script(site: &str, enabled: &str, content: &str, disable: &[String]) -> String {
    let candidate = format!("{site}.candidate");
    let (site_q, enabled_q, candidate_q) = (
        shell_quote(site),
        shell_quote(enabled),
        shell_quote(&candidate),
    );
    let mut script = write_file_atomically(&candidate, content, "0644");
    script.push_str(
        "\nbackup_dir=$(mktemp -d)\n\
         stash() { if [ -e \"$1\" ] || [ -L \"$1\" ]; then mv -f \"$1\" \"$backup_dir/$2\"; fi; }\n\
         unstash() { rm -f \"$1\"; if [ -e \"$backup_dir/$2\" ] || [ -L \"$backup_dir/$2\" ]; then mv -f \"$backup_dir/$2\" \"$1\"; fi; }\n",
    );
    let mut entries = vec![
        (site_q.clone(), "site".to_string()),
        (enabled_q.clone(), "enabled".to_string()),
    ];
    for (index, path) in disable.iter().enumerate() {
        entries.push((shell_quote(path), format!("disabled{index}")));
    }
    for (path, slot) in &entries {
        script.push_str(&format!("stash {path} {slot}\n"));
    }
    script.push_str(&format!(
        "if mv -f {candidate_q} {site_q} && ln -sfn {site_q} {enabled_q} && nginx -t; then\n\
         rm -rf \"$backup_dir\"\n\
         else\n\
         rm -f {candidate_q}\n"
    ));
    for (path, slot) in &entries {
        script.push_str(&format!("unstash {path} {slot}\n"));
    }
    script.push_str(
        "rm -rf \"$backup_dir\"\n\
         echo 'nginx rejected the new site; previous configuration restored' >&2\n\
         exit 1\n\
         fi",
    );
    script
}

fn site_conditions(site: &str, enabled: &str, content: &str) -> Vec<String> {
    vec![
        content_matches(site, content),
        format!(
            "[ \"$(readlink {})\" = {} ]",
            shell_quote(enabled),
            shell_quote(site)
        ),
    ]
}

/// Conditions joined with `&&`, usable as a single condition.
fn all_of(conditions: &[String]) -> String {
    conditions
        .iter()
        .map(|condition| format!("{{ {condition}\n}}"))
        .collect::<Vec<_>>()
        .join(" && ")
}

/// Sites-enabled entries that must go when this site is the default server.
fn displaced_sites(settings: &DeploySettings) -> Vec<String> {
    if !settings.proxy.default_server {
        return Vec::new();
    }
    vec![format!(
        "{}/default",
        settings.proxy.sites_enabled_dir.trim_end_matches('/')
    )]
}

/// Conditions and apply script for the HTTP site with `content`.
fn http_site(settings: &DeploySettings, content: &str) -> (Vec<String>, String) {
    let site = settings.site_path();
    let enabled = settings.site_enabled_path();
    let displaced = displaced_sites(settings);
    let mut conditions = site_conditions(&site, &enabled, content);
    for path in &displaced {
        conditions.push(format!("test ! -e {0} && test ! -L {0}", shell_quote(path)));
    }
    let script = apply_site_script(&site, &enabled, content, &displaced);
    (conditions, script)
}

/// Condition: the certificate exists and its TLS site is enabled.
fn tls_live(settings: &DeploySettings, cert: &CertificateSettings) -> String {
    format!(
        "test -f {} && test -L {}",
        shell_quote(&cert.fullchain_path()),
        shell_quote(&settings.tls_site_enabled_path())
    )
}

pub fn configure_reverse_proxy(settings: &DeploySettings) -> Plan {
    let site = settings.site_path();
    let applied = format!("{}/site.applied", settings.system_state_dir());
    let (plain_conditions, plain_script) = http_site(settings, &render_nginx_site(settings));

    // Once TLS is live the HTTP site is the redirect written by
    // issue-certificate; rewriting it here would undo that on every run.
    let redirect = settings
        .certificate
        .as_ref()
        .zip(render_nginx_redirect_site(settings));
    let (conditions, script) = match redirect {
        Some((cert, redirect)) => {
            let live = tls_live(settings, cert);
            let (redirect_conditions, redirect_script) = http_site(settings, &redirect);
            (
                vec![format!(
                    "if {live}; then {}; else {}; fi",
                    all_of(&redirect_conditions),
                    all_of(&plain_conditions)
                )],
                format!(
                    "if {live}; then {}; else {}; fi",
                    privileged(false, &redirect_script),
                    privileged(false, &plain_script)
                ),
            )
        }
        None => (plain_conditions, plain_script),
    };

    let (pre, post) = converged(
        "live site matches the rendered configuration and is enabled",
        root_check(settings, &conditions),
    );
    let write_proxy_config = step(
        settings,
        "write-proxy-config",
        "Install the nginx site, keeping the previous one if validation fails",
        pre,
        vec![privileged(settings.use_sudo, &script)],
        post,
    );

    let (pre, post) = converged(
        "nginx is running with the current site",
        root_check(
            settings,
            &[
                format!("cmp -s {} {}", shell_quote(&site), shell_quote(&applied)),
                unit_active("nginx"),
            ],
        ),
    );
    let reload_proxy = step(
        settings,
        "reload-proxy",
        "Validate and reload nginx",
        pre,
        vec![privileged(
            settings.use_sudo,
            &format!(
                "set -e\nnginx -t\nsystemctl reload-or-restart nginx\nmkdir -p {state}\ncp {site} {applied}",
                state = shell_quote(&settings.system_state_dir()),
                site = shell_quote(&site),
                applied = shell_quote(&applied),
            ),
        )],
        post,
    );

    Plan::new(
        "configure-reverse-proxy",
        vec![write_proxy_config, reload_proxy],
    )
}

fn certificate_conditions(cert: &CertificateSettings) -> Vec<String> {
    let fullchain = shell_quote(&cert.fullchain_path());
    let mut conditions = vec![
        format!("test -f {fullchain}"),
        format!(
            "openssl x509 -checkend {} -noout -in {fullchain} >/dev/null",
            cert.renew_threshold_secs()
        ),
    ];
    for domain in &cert.domains {
        conditions.push(format!(
            "openssl x509 -noout -text -in {fullchain} | grep -qF {}",
            shell_quote(&format!("DNS:{domain}"))
        ));
    }
    conditions
}

pub fn issue_certificate(settings: &DeploySettings, cert: &CertificateSettings) -> Plan {
    let challenge_dir = format!(
        "{}/.well-known/acme-challenge",
        cert.webroot.trim_end_matches('/')
    );
    let (pre, post) = converged(
        "ACME webroot exists",
        root_check(settings, &[format!("test -d {}", shell_quote(&challenge_dir))]),
    );
    let ensure_webroot = step(
        settings,
        "ensure-acme-webroot",
        "Create the ACME challenge webroot",
        pre,
        vec![privileged(
            settings.use_sudo,
            &format!(
                "mkdir -p {dir} && chmod 755 {dir}",
                dir = shell_quote(&challenge_dir)
            ),
        )],
        post,
    );

    let mut certbot = format!(
        "certbot certonly --webroot -w {} --cert-name {} --email {} \
         --agree-tos --non-interactive --force-renewal",
        shell_quote(&cert.webroot),
        shell_quote(cert.primary_domain()),
        shell_quote(&cert.email),
    );
    for domain in &cert.domains {
        certbot.push_str(&format!(" -d {}", shell_quote(domain)));
    }
    let (pre, post) = converged(
        &format!(
            "certificate covers every domain and is valid for more than {} days",
            cert.renew_before_days
        ),
        root_check(settings, &certificate_conditions(cert)),
    );
    let issue = Step {
        on_failure: FailurePolicy::retry_then_abort(1),
        timeout_secs: settings.timeouts.certificate_secs,
        ..step(
            settings,
            "issue-certificate",
            "Obtain or renew the TLS certificate",
            pre,
            vec![privileged(settings.use_sudo, &certbot)],
            post,
        )
    };

    let tls_site = settings.tls_site_path();
    let tls_enabled = settings.tls_site_enabled_path();
    let tls_rendered = render_nginx_tls_site(settings).unwrap_or_default();
    let (pre, post) = converged(
        "live TLS site matches the rendered configuration and is enabled",
        root_check(settings, &site_conditions(&tls_site, &tls_enabled, &tls_rendered)),
    );
    let write_tls = step(
        settings,
        "write-tls-proxy-config",
        "Install the nginx TLS site, keeping the previous one if validation fails",
        pre,
        vec![privileged(
            settings.use_sudo,
            &apply_site_script(&tls_site, &tls_enabled, &tls_rendered, &[]),
        )],
        post,
    );

    let redirect = render_nginx_redirect_site(settings).unwrap_or_default();
    let (conditions, script) = http_site(settings, &redirect);
    let (pre, post) = converged(
        "HTTP site redirects to HTTPS",
        root_check(settings, &conditions),
    );
    let redirect_http = step(
        settings,
        "redirect-http-to-https",
        "Send plain HTTP traffic to the TLS site",
        pre,
        vec![privileged(settings.use_sudo, &script)],
        post,
    );

    let state_dir = settings.system_state_dir();
    let site = settings.site_path();
    let site_applied = format!("{state_dir}/site.applied");
    let applied = format!("{state_dir}/tls-site.applied");
    let cert_stamp = format!("{state_dir}/certificate.sha256");
    let fullchain = cert.fullchain_path();
    let (pre, post) = converged(
        "nginx is running with the current TLS and redirect sites and certificate",
        root_check(
            settings,
            &[
                format!("cmp -s {} {}", shell_quote(&tls_site), shell_quote(&applied)),
                format!("cmp -s {} {}", shell_quote(&site), shell_quote(&site_applied)),
                digest_matches(&fullchain, &cert_stamp),
                unit_active("nginx"),
            ],
        ),
    );
    let reload_tls = step(
        settings,
        "reload-proxy-tls",
        "Validate and reload nginx with the TLS site",
        pre,
        vec![privileged(
            settings.use_sudo,
            &format!(
                "set -e\nnginx -t\nsystemctl reload-or-restart nginx\nmkdir -p {state}\n\
                 cp {tls_site} {applied}\ncp {site} {site_applied}\n{record}",
                state = shell_quote(&state_dir),
                tls_site = shell_quote(&tls_site),
                applied = shell_quote(&applied),
                site = shell_quote(&site),
                site_applied = shell_quote(&site_applied),
                record = record_digest(&fullchain, &cert_stamp),
            ),
        )],
        post,
    );

    let mut steps = vec![ensure_webroot, issue, write_tls, redirect_http, reload_tls];

    if cert.enable_renewal_timer {
        let (pre, post) = converged(
            "certbot renewal timer is enabled and active",
            root_check(
                settings,
                &[
                    "systemctl is-enabled --quiet certbot.timer".to_string(),
                    unit_active("certbot.timer"),
                ],
            ),
        );
        steps.push(Step {
            on_failure: FailurePolicy::Continue,
            ..step(
                settings,
                "enable-renewal-timer",
                "Enable automatic certificate renewal",
                pre,
                vec![privileged(
                    settings.use_sudo,
                    "systemctl enable --now certbot.timer",
                )],
                post,
            )
        });
    }

    Plan::new("issue-certificate", steps)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::{symlink, PermissionsExt};
    use std::path::{Path, PathBuf};
    use std::process::Command;

    struct SiteHost {
        _root: tempfile::TempDir,
        available: PathBuf,
        enabled: PathBuf,
        bin: PathBuf,
        settings: DeploySettings,
    }

    impl SiteHost {
        /// An nginx layout with an existing `shop.conf`, an enabled entry
        /// pointing at another site, and the distribution's default site.
        fn new() -> Self {
            let root = tempfile::tempdir().expect("tempdir");
            let available = root.path().join("available");
            let enabled = root.path().join("enabled");
            let bin = root.path().join("bin");
            for dir in [&available, &enabled, &bin] {
                fs::create_dir_all(dir).expect("mkdir");
            }
            fs::write(available.join("shop.conf"), "old shop site\n").expect("site");
            fs::write(available.join("other.conf"), "other site\n").expect("other");
            fs::write(available.join("default"), "default site\n").expect("default");
            symlink(available.join("other.conf"), enabled.join("shop.conf")).expect("link");
            symlink(available.join("default"), enabled.join("default")).expect("default link");

            let settings = DeploySettings::from_json(&format!(
                r#"{{
                    "app_name": "shop",
                    "app_dir": "/var/www/shop",
                    "repo_url": "https://git.example.com/acme/shop.git",
                    "proxy": {{
                        "server_names": ["shop.example.com"],
                        "default_server": true,
                        "sites_available_dir": "{}",
                        "sites_enabled_dir": "{}"
                    }}
                }}"#,
                available.display(),
                enabled.display()
            ))
            .expect("settings");
            Self {
                _root: root,
                available,
                enabled,
                bin,
                settings,
            }
        }

        fn nginx_exits_with(&self, code: i32) {
            let path = self.bin.join("nginx");
            fs::write(&path, format!("#!/bin/sh\nexit {code}\n")).expect("nginx");
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).expect("chmod");
        }

        fn sh(&self, script: &str) -> i32 {
            let path = format!(
                "{}:{}",
                self.bin.display(),
                std::env::var("PATH").unwrap_or_default()
            );
            Command::new("sh")
                .arg("-c")
                .arg(script)
                .env("PATH", path)
                .status()
                .expect("sh")
                .code()
                .unwrap_or(-1)
        }
    }

    fn exists(path: &Path) -> bool {
        fs::symlink_metadata(path).is_ok()
    }

    #[test]
    fn rejected_site_restores_links_and_default_site() {
        let host = SiteHost::new();
        host.nginx_exits_with(1);
        let plan = configure_reverse_proxy(&host.settings);
        let write = &plan.steps[0];

        assert_ne!(host.sh(&write.action[0]), 0);
        assert_eq!(
            fs::read_to_string(host.available.join("shop.conf")).expect("site"),
            "old shop site\n"
        );
        assert_eq!(
            fs::read_link(host.enabled.join("shop.conf")).expect("link"),
            host.available.join("other.conf")
        );
        assert_eq!(
            fs::read_link(host.enabled.join("default")).expect("default link"),
            host.available.join("default")
        );
        assert!(!exists(&host.available.join("shop.conf.candidate")));
        assert_eq!(host.sh(&write.precondition.command), 1);
    }

    #[test]
    fn accepted_site_is_enabled_and_converged() {
        let host = SiteHost::new();
        host.nginx_exits_with(0);
        let plan = configure_reverse_proxy(&host.settings);
        let write = &plan.steps[0];
        assert_eq!(host.sh(&write.precondition.command), 1);

        assert_eq!(host.sh(&write.action[0]), 0);
        let site = host.available.join("shop.conf");
        assert_eq!(
            fs::read_to_string(&site).expect("site"),
            render_nginx_site(&host.settings)
        );
        assert_eq!(fs::read_link(host.enabled.join("shop.conf")).expect("link"), site);
        assert!(!exists(&host.enabled.join("default")));
        assert!(host.available.join("default").exists());
        assert_eq!(host.sh(&write.postcondition.command), 0);

        assert_eq!(host.sh(&write.action[0]), 0);
        assert_eq!(host.sh(&write.postcondition.command), 0);
    }

    #[test]
    fn missing_site_is_removed_again_on_rejection() {
        let host = SiteHost::new();
        fs::remove_file(host.enabled.join("shop.conf")).expect("unlink");
        fs::remove_file(host.available.join("shop.conf")).expect("rm");
        host.nginx_exits_with(1);
        let plan = configure_reverse_proxy(&host.settings);

        assert_ne!(host.sh(&plan.steps[0].action[0]), 0);
        assert!(!exists(&host.available.join("shop.conf")));
        assert!(!exists(&host.enabled.join("shop.conf")));
        assert!(exists(&host.enabled.join("default")));
    }
}
