mod continuity;
mod manifests;
mod migrations;
