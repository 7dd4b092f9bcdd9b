fn main() {
    sph_engine::start();
}
