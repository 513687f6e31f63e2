use http::Method;

use crate::config::ProxyConfig;

/// The outcome of classifying one request by `(SNI host, method, path)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Respond `302 Found` with `Location: <mirror_direct_base_url><path>`
    /// directly — no upstream connection is opened.
    MirrorRedirect { location: String },
    /// Same target host as `MirrorRedirect`, but the body/query string must
    /// survive, so the request is proxied through rather than redirected.
    MirrorForward { target_base_url: String },
    /// Hand the connection to the Bancho splicer; the router takes no
    /// further part in this connection.
    BanchoSplice,
    /// Forward to the official upstream at `target_host:443`.
    UpstreamPassthrough { target_host: String },
    /// SNI host recognized by nothing in the table.
    MisdirectedRequest,
}

/// Classify one request. A fixed decision procedure — first match wins — not
/// a registry, since the route set is small and closed. Pure function of its
/// inputs: same `(config, host, method, path)` always yields the same
/// [`Route`] (§8 property 6).
pub fn classify(config: &ProxyConfig, sni_host: &str, method: &Method, path: &str) -> Route {
    if sni_host == config.bancho_host() {
        return Route::BanchoSplice;
    }

    if sni_host == config.osu_host() && *method == Method::GET {
        if path_matches(path, "/web/osu-search.php")
            || path_matches(path, "/web/osu-search-set.php")
            || path_matches(path, "/web/osu-getbeatmapinfo.php")
        {
            return Route::MirrorForward {
                target_base_url: config.mirror_api_base_url.clone(),
            };
        }

        if let Some(download_path) = beatmap_download_suffix(path) {
            return Route::MirrorRedirect {
                location: format!("{}{}", config.mirror_direct_base_url, download_path),
            };
        }
    }

    if sni_host == config.beatmap_host()
        && *method == Method::GET
        && (path.starts_with("/thumb/") || path.starts_with("/preview/"))
    {
        return Route::MirrorRedirect {
            location: format!("{}{}", config.mirror_direct_base_url, path),
        };
    }

    if config.is_official_suffix(sni_host) {
        return Route::UpstreamPassthrough {
            target_host: sni_host.to_owned(),
        };
    }

    Route::MisdirectedRequest
}

/// `true` if `path` is `prefix` optionally followed by a `?query`.
fn path_matches(path: &str, prefix: &str) -> bool {
    path == prefix || path.starts_with(&format!("{prefix}?"))
}

/// `/d/<id>` or `/d/<id>n` → `Some("/d/<id>")` or `Some("/d/<id>n")`.
fn beatmap_download_suffix(path: &str) -> Option<&str> {
    let rest = path.strip_prefix("/d/")?;
    let digits = rest.strip_suffix('n').unwrap_or(rest);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        Some(path)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ProxyConfig {
        ProxyConfig {
            official_base_host: "ppy.sh".to_owned(),
            mirror_api_base_url: "https://api.nerinyan.moe".to_owned(),
            mirror_direct_base_url: "https://api.nerinyan.moe".to_owned(),
            ..Default::default()
        }
    }

    #[test]
    fn bancho_host_always_splices() {
        let cfg = cfg();
        assert_eq!(
            classify(&cfg, "c.ppy.sh", &Method::POST, "/"),
            Route::BanchoSplice
        );
        assert_eq!(
            classify(&cfg, "c.ppy.sh", &Method::GET, "/anything"),
            Route::BanchoSplice
        );
    }

    #[test]
    fn beatmap_download_redirects() {
        let cfg = cfg();
        assert_eq!(
            classify(&cfg, "osu.ppy.sh", &Method::GET, "/d/1234"),
            Route::MirrorRedirect {
                location: "https://api.nerinyan.moe/d/1234".to_owned()
            }
        );
        assert_eq!(
            classify(&cfg, "osu.ppy.sh", &Method::GET, "/d/1234n"),
            Route::MirrorRedirect {
                location: "https://api.nerinyan.moe/d/1234n".to_owned()
            }
        );
    }

    #[test]
    fn search_endpoints_forward_with_query() {
        let cfg = cfg();
        assert_eq!(
            classify(
                &cfg,
                "osu.ppy.sh",
                &Method::GET,
                "/web/osu-search.php?q=foo"
            ),
            Route::MirrorForward {
                target_base_url: "https://api.nerinyan.moe".to_owned()
            }
        );
        assert_eq!(
            classify(&cfg, "osu.ppy.sh", &Method::GET, "/web/osu-search-set.php"),
            Route::MirrorForward {
                target_base_url: "https://api.nerinyan.moe".to_owned()
            }
        );
    }

    #[test]
    fn thumb_and_preview_redirect() {
        let cfg = cfg();
        assert_eq!(
            classify(&cfg, "b.ppy.sh", &Method::GET, "/thumb/1234l.jpg"),
            Route::MirrorRedirect {
                location: "https://api.nerinyan.moe/thumb/1234l.jpg".to_owned()
            }
        );
        assert_eq!(
            classify(&cfg, "b.ppy.sh", &Method::GET, "/preview/1234.mp3"),
            Route::MirrorRedirect {
                location: "https://api.nerinyan.moe/preview/1234.mp3".to_owned()
            }
        );
    }

    #[test]
    fn unrelated_official_subdomain_passes_through() {
        let cfg = cfg();
        assert_eq!(
            classify(
                &cfg,
                "osu.ppy.sh",
                &Method::POST,
                "/web/osu-submit-modular-selector.php"
            ),
            Route::UpstreamPassthrough {
                target_host: "osu.ppy.sh".to_owned()
            }
        );
        assert_eq!(
            classify(&cfg, "a.ppy.sh", &Method::GET, "/anything"),
            Route::UpstreamPassthrough {
                target_host: "a.ppy.sh".to_owned()
            }
        );
    }

    #[test]
    fn unknown_host_is_misdirected() {
        let cfg = cfg();
        assert_eq!(
            classify(&cfg, "evil.example.com", &Method::GET, "/"),
            Route::MisdirectedRequest
        );
    }

    #[test]
    fn classification_is_a_pure_function() {
        let cfg = cfg();
        let a = classify(&cfg, "osu.ppy.sh", &Method::GET, "/d/42");
        let b = classify(&cfg, "osu.ppy.sh", &Method::GET, "/d/42");
        assert_eq!(a, b);
    }
}
