//! Read-only status server.
//!
//! Serves an HTML view of the tracked containers grouped by project and a
//! JSON snapshot for programmatic consumers. Both endpoints read copies
//! out of the store; nothing here can mutate supervisor state.

use crate::store::{ContainerRecord, ContainerStore};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use tracing::info;
use warp::Filter;

pub async fn serve(
    store: Arc<ContainerStore>,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) {
    let with_store = {
        let store = store.clone();
        warp::any().map(move || store.clone())
    };

    let index = warp::get()
        .and(warp::path::end())
        .and(with_store.clone())
        .and_then(render_index);

    let api = warp::get()
        .and(warp::path!("api" / "containers"))
        .and(with_store)
        .and_then(list_containers);

    let routes = index.or(api);

    info!("status server listening on port {}", port);
    let (_, server) =
        warp::serve(routes).bind_with_graceful_shutdown(([0, 0, 0, 0], port), shutdown);
    server.await;
}

async fn render_index(store: Arc<ContainerStore>) -> Result<impl warp::Reply, Infallible> {
    let total = store.get_all().await.len();
    // BTreeMap for a stable section order across reloads.
    let groups: BTreeMap<String, Vec<ContainerRecord>> =
        store.group_by_project().await.into_iter().collect();
    Ok(warp::reply::html(render_page(&groups, total)))
}

async fn list_containers(store: Arc<ContainerStore>) -> Result<impl warp::Reply, Infallible> {
    let mut containers = store.get_all().await;
    containers.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(warp::reply::json(&containers))
}

fn render_page(groups: &BTreeMap<String, Vec<ContainerRecord>>, total: usize) -> String {
    let mut page = String::from(
        "<!DOCTYPE html>\n<html>\n<head>\n<title>portshift</title>\n<style>\n\
         body { font-family: sans-serif; margin: 20px; }\n\
         table { border-collapse: collapse; width: 100%; margin-bottom: 24px; }\n\
         th, td { text-align: left; padding: 8px; border-bottom: 1px solid #ddd; }\n\
         th { background-color: #3498db; color: white; }\n\
         .remapped { color: #e67e22; font-weight: bold; }\n\
         .original { text-decoration: line-through; color: #e74c3c; }\n\
         </style>\n</head>\n<body>\n<h1>portshift</h1>\n",
    );
    page.push_str(&format!("<p>Total containers: {}</p>\n", total));

    for (project, containers) in groups {
        page.push_str(&format!("<h2>Project: {}</h2>\n<table>\n", escape(project)));
        page.push_str(
            "<tr><th>Container</th><th>Image</th><th>Service</th><th>Status</th>\
             <th>Port Mappings</th></tr>\n",
        );
        let mut containers = containers.clone();
        containers.sort_by(|a, b| a.name.cmp(&b.name));
        for container in &containers {
            page.push_str(&format!(
                "<tr><td>{}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>\n",
                escape(&container.name),
                escape(&container.image),
                escape(&container.service),
                escape(&container.status),
                render_bindings(container),
            ));
        }
        page.push_str("</table>\n");
    }

    page.push_str("</body>\n</html>\n");
    page
}

fn render_bindings(container: &ContainerRecord) -> String {
    container
        .bindings
        .iter()
        .map(|binding| {
            if binding.is_remapped() {
                format!(
                    "<span class=\"remapped\">{}</span>:{}/{} \
                     <span class=\"original\">(was {})</span>",
                    binding.host_port,
                    binding.container_port,
                    binding.protocol,
                    binding.original_port
                )
            } else {
                format!(
                    "{}:{}/{}",
                    binding.host_port, binding.container_port, binding.protocol
                )
            }
        })
        .collect::<Vec<_>>()
        .join("<br>")
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
